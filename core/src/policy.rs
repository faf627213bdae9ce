//! Command blocklist/allowlist (§6 `security.command_blocklist`,
//! `command_allowlist`), consulted by `Session::exec` before anything is
//! written to the channel. Compiled once at `SessionManager::new` time (same
//! fail-fast-at-startup treatment `config.rs` gives custom prompt patterns)
//! rather than re-compiled on every `exec` call.

use regex::Regex;

use crate::error::{SessionError, SessionResult};

pub struct CommandPolicy {
    blocklist: Vec<Regex>,
    allowlist: Vec<Regex>,
}

impl CommandPolicy {
    pub fn compile(blocklist: &[String], allowlist: &[String]) -> SessionResult<Self> {
        let compile_all = |patterns: &[String]| -> SessionResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| SessionError::ConfigInvalid(format!("command policy pattern {p:?}: {e}"))))
                .collect()
        };
        Ok(Self {
            blocklist: compile_all(blocklist)?,
            allowlist: compile_all(allowlist)?,
        })
    }

    /// `Err` names the pattern that blocked the command; callers surface it
    /// as `SessionError::CommandBlocked` before writing anything to the
    /// channel.
    pub fn check(&self, command: &str) -> Result<(), String> {
        for pattern in &self.blocklist {
            if pattern.is_match(command) {
                return Err(format!("matches blocklist pattern {:?}", pattern.as_str()));
            }
        }
        if !self.allowlist.is_empty() && !self.allowlist.iter().any(|p| p.is_match(command)) {
            return Err("does not match any allowlist pattern".to_string());
        }
        Ok(())
    }
}
