//! Static configuration, loaded once at startup (not hot-reloaded).
//!
//! Shape and the load/validate split follow the CLI's `AppConfig`: deserialize
//! permissively, then run one explicit `validate()` pass that fills in safe
//! defaults for out-of-range values rather than rejecting the whole file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    #[serde(alias = "")]
    Auto,
    Local,
    Ssh,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_sessions_per_user: usize,
    pub idle_timeout_secs: u64,
    pub sudo_cache_ttl_secs: u64,
    pub command_blocklist: Vec<String>,
    pub command_allowlist: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 10,
            idle_timeout_secs: 1800,
            sudo_cache_ttl_secs: 300,
            command_blocklist: Vec::new(),
            command_allowlist: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sudo_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sudo_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Whether the interactive shell is allowed to source its rc/profile
    /// files. When `false`, `LocalChannel::spawn` appends the shell's
    /// rc-suppression flags (e.g. bash's `--norc --noprofile`).
    pub source_rc: bool,
    pub path: Option<String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            source_rc: true,
            path: None,
            rows: 24,
            cols: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomPatternConfig {
    pub name: String,
    pub regex: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mask_input: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PromptDetectionConfig {
    pub custom_patterns: Vec<CustomPatternConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub security: SecurityConfig,
    pub shell: ShellConfig,
    pub prompt_detection: PromptDetectionConfig,
}

impl Config {
    pub async fn load(
        fs: &dyn crate::fs::FileSystem,
        path: &Path,
    ) -> SessionResult<Self> {
        let raw = fs
            .read(path)
            .await
            .map_err(|e| SessionError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
        let text = String::from_utf8(raw)
            .map_err(|e| SessionError::ConfigInvalid(format!("{} is not valid utf-8: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| SessionError::ConfigInvalid(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Synchronous convenience for the CLI and tests: reads straight off
    /// `std::fs` rather than through the injected `FileSystem` capability.
    /// Anything that needs to be testable against a fake filesystem should
    /// use `load()` instead.
    pub fn from_file(path: &Path) -> SessionResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| SessionError::ConfigInvalid(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Corrects out-of-range values to safe defaults and compiles custom
    /// prompt patterns once, so bad regexes fail fast at startup rather than
    /// mid-session.
    pub fn validate(&mut self) -> SessionResult<()> {
        if self.security.max_sessions_per_user == 0 {
            self.security.max_sessions_per_user = 10;
        }
        if self.shell.rows == 0 {
            self.shell.rows = 24;
        }
        if self.shell.cols == 0 {
            self.shell.cols = 120;
        }
        for pattern in &self.prompt_detection.custom_patterns {
            regex::Regex::new(&pattern.regex).map_err(|e| {
                SessionError::ConfigInvalid(format!(
                    "custom pattern {:?} has invalid regex: {e}",
                    pattern.name
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.security.max_sessions_per_user, 10);
    }

    #[test]
    fn zero_max_sessions_is_corrected() {
        let mut config = Config {
            security: SecurityConfig {
                max_sessions_per_user: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap_or_default();
        assert_eq!(config.security.max_sessions_per_user, 10);
    }

    #[test]
    fn from_file_reads_and_validates_toml() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[security]\nmax_sessions_per_user = 0\n").unwrap_or_default();
        let config = Config::from_file(&path).unwrap_or_else(|e| panic!("from_file failed: {e}"));
        assert_eq!(config.security.max_sessions_per_user, 10);
    }

    #[test]
    fn invalid_custom_regex_is_rejected() {
        let mut config = Config {
            prompt_detection: PromptDetectionConfig {
                custom_patterns: vec![CustomPatternConfig {
                    name: "broken".into(),
                    regex: "(unclosed".into(),
                    kind: "confirmation".into(),
                    mask_input: false,
                }],
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
