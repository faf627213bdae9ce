//! Interactive-prompt detection.
//!
//! Structured the way the secret-redaction pass builds its rule list: a
//! priority-ordered catalogue of named patterns, each carrying enough
//! metadata (kind, whether input should be masked, a suggested response) to
//! drive the caller's next action without re-deriving it from the raw text.
//! Custom patterns from config are tried before the built-ins so operators
//! can override or narrow detection for their own tooling.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::PromptDetectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptType {
    Password,
    Confirmation,
    Text,
    Editor,
    Pager,
}

impl PromptType {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "password" => Some(Self::Password),
            "confirmation" => Some(Self::Confirmation),
            "text" => Some(Self::Text),
            "editor" => Some(Self::Editor),
            "pager" => Some(Self::Pager),
            _ => None,
        }
    }

    /// Short hint for a caller deciding how to respond, mirroring the advice
    /// baked into each built-in pattern.
    pub fn hint(self) -> &'static str {
        match self {
            Self::Password => "credential requested; respond with mask_input=true",
            Self::Confirmation => "yes/no confirmation requested",
            Self::Text => "free-form input requested",
            Self::Editor => "command dropped into a full-screen editor",
            Self::Pager => "output paused in a pager",
        }
    }
}

struct Pattern {
    name: &'static str,
    regex: Regex,
    kind: PromptType,
    mask_input: bool,
    suggested_response: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub pattern_name: String,
    pub kind: PromptType,
    pub matched_text: String,
    pub mask_input: bool,
    pub suggested_response: Option<String>,
    pub confidence: f32,
}

fn compiled(name: &'static str, pattern: &str, kind: PromptType, mask_input: bool, suggested: Option<&'static str>) -> Pattern {
    #[allow(clippy::expect_used)]
    let regex = Regex::new(pattern).expect("built-in prompt pattern must compile");
    Pattern {
        name,
        regex,
        kind,
        mask_input,
        suggested_response: suggested,
    }
}

fn builtin_patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            compiled(
                "sudo_password",
                r"(?i)\[sudo\] password for [^:]+:\s*$",
                PromptType::Password,
                true,
                None,
            ),
            compiled(
                "ssh_passphrase",
                r"(?i)enter passphrase for key[^:]*:\s*$",
                PromptType::Password,
                true,
                None,
            ),
            compiled(
                "generic_password",
                r"(?i)(^|\s)password(\s+for\s+\S+)?:\s*$",
                PromptType::Password,
                true,
                None,
            ),
            compiled(
                "ssh_host_key_confirm",
                r"(?i)are you sure you want to continue connecting \(yes/no(/\[fingerprint\])?\)\?\s*$",
                PromptType::Confirmation,
                false,
                Some("yes"),
            ),
            compiled(
                "docker_prune_confirm",
                r"(?i)are you sure you want to continue\?\s*\[y/n\]\s*$",
                PromptType::Confirmation,
                false,
                Some("y"),
            ),
            compiled(
                "apt_pacman_confirm",
                r"(?i)\[y/n\]\s*$",
                PromptType::Confirmation,
                false,
                Some("y"),
            ),
            compiled(
                "yum_dnf_confirm",
                r"(?i)\[y/d/n\]:\s*$",
                PromptType::Confirmation,
                false,
                Some("y"),
            ),
            compiled(
                "generic_yn_confirm",
                r"(?i)\[y/n\]\?\s*$|\(y/n\)\s*$",
                PromptType::Confirmation,
                false,
                Some("y"),
            ),
            compiled(
                "npm_init_field",
                r"(?i)^\s*(package name|version|description|entry point|test command|git repository|keywords|author|license)\s*:\s*\([^)]*\)\s*$",
                PromptType::Text,
                false,
                None,
            ),
            compiled(
                "git_credential_username",
                r"(?i)username for '[^']+':\s*$",
                PromptType::Text,
                false,
                None,
            ),
            compiled(
                "git_credential_password",
                r"(?i)password for '[^']+':\s*$",
                PromptType::Password,
                true,
                None,
            ),
            compiled("vim_insert_mode", r"-- INSERT --", PromptType::Editor, false, None),
            compiled("vim_visual_mode", r"-- VISUAL( LINE)? --", PromptType::Editor, false, None),
            compiled("nano_banner", r"GNU nano \d", PromptType::Editor, false, None),
            compiled("less_end", r"\(END\)\s*$", PromptType::Pager, false, Some("q")),
            compiled("more_prompt", r"--More--(\(\d+%\))?\s*$", PromptType::Pager, false, Some("q")),
            compiled("man_page_line", r"(?i)^\s*manual page .* line \d+", PromptType::Pager, false, Some("q")),
            compiled("mysql_prompt", r"(?m)^mysql>\s*$", PromptType::Text, false, None),
            compiled("postgres_prompt", r"(?m)^\S+=[#>]\s*$", PromptType::Text, false, None),
            compiled("redis_prompt", r"(?m)^\S+:\d+>\s*$", PromptType::Text, false, None),
            compiled("python_repl_prompt", r"(?m)^>>>\s*$", PromptType::Text, false, None),
        ]
    })
}

pub struct PromptDetector {
    custom: Vec<Pattern>,
}

impl PromptDetector {
    pub fn new(config: &PromptDetectionConfig) -> Result<Self, regex::Error> {
        let mut custom = Vec::with_capacity(config.custom_patterns.len());
        for p in &config.custom_patterns {
            let regex = Regex::new(&p.regex)?;
            let kind = PromptType::from_str_lenient(&p.kind).unwrap_or(PromptType::Text);
            custom.push(Pattern {
                name: Box::leak(p.name.clone().into_boxed_str()),
                regex,
                kind,
                mask_input: p.mask_input,
                suggested_response: None,
            });
        }
        Ok(Self { custom })
    }

    /// Last few lines of the buffer, the window a human would actually read
    /// to decide whether a shell is waiting on them.
    fn tail_window(buffer: &str) -> String {
        const MAX_LINES: usize = 10;
        const MAX_BYTES: usize = 4096;
        let lines: Vec<&str> = buffer.lines().collect();
        let start = lines.len().saturating_sub(MAX_LINES);
        let joined = lines[start..].join("\n");
        if joined.len() > MAX_BYTES {
            let cut = joined.len() - MAX_BYTES;
            joined[cut..].to_string()
        } else {
            joined
        }
    }

    pub fn detect(&self, buffer: &str) -> Option<Detection> {
        self.detect_with_command(buffer, None)
    }

    /// Like `detect`, but also takes the command string that produced
    /// `buffer` so the heuristic fallback's confidence bump (§4.2: `sudo `,
    /// `apt `, `npm `, `git ` prefixes) has something to bump against.
    pub fn detect_with_command(&self, buffer: &str, command: Option<&str>) -> Option<Detection> {
        let window = Self::tail_window(buffer);
        for pattern in self.custom.iter().chain(builtin_patterns().iter()) {
            if let Some(m) = pattern.regex.find(&window) {
                return Some(Detection {
                    pattern_name: pattern.name.to_string(),
                    kind: pattern.kind,
                    matched_text: m.as_str().to_string(),
                    mask_input: pattern.mask_input,
                    suggested_response: pattern.suggested_response.map(str::to_string),
                    confidence: 1.0,
                });
            }
        }
        self.heuristic(&window, command)
    }

    /// Applies every pattern (custom first, then built-ins) and returns
    /// every match, in pattern order. Does not run the heuristic fallback —
    /// that only ever applies when nothing in the catalogue matched, so it
    /// has nothing to contribute to an "all matches" diagnostic view.
    pub fn detect_all(&self, buffer: &str) -> Vec<Detection> {
        let window = Self::tail_window(buffer);
        self.custom
            .iter()
            .chain(builtin_patterns().iter())
            .filter_map(|pattern| {
                pattern.regex.find(&window).map(|m| Detection {
                    pattern_name: pattern.name.to_string(),
                    kind: pattern.kind,
                    matched_text: m.as_str().to_string(),
                    mask_input: pattern.mask_input,
                    suggested_response: pattern.suggested_response.map(str::to_string),
                    confidence: 1.0,
                })
            })
            .collect()
    }

    /// Confidence-scored fallback for prompts with no catalogued pattern,
    /// applied in the tiered order spec §4.2 lists: password/passphrase/
    /// secret keywords, then Y/N brackets, then confirmation phrases, then a
    /// generic trailing colon/question line that isn't itself a shell
    /// prompt. The `< 100` char / no-tab / not-a-shell-prompt constraints
    /// belong to that last, generic tier only — a long line still counts as
    /// a credential or confirmation prompt if it contains the keyword. A
    /// command beginning with `sudo `/`apt `/`npm `/`git ` bumps confidence
    /// by 0.1 for a matching-type prompt.
    fn heuristic(&self, window: &str, command: Option<&str>) -> Option<Detection> {
        let trimmed = window.trim_end_matches('\n');
        let last_line = trimmed.rsplit('\n').next().unwrap_or("").trim_end();
        if last_line.is_empty() {
            return None;
        }
        let lower = last_line.to_ascii_lowercase();

        let bump = |kind: PromptType, base: f32| -> f32 {
            let prefix_matches = command.is_some_and(|c| {
                let c = c.trim_start();
                c.starts_with("sudo ") || c.starts_with("apt ") || c.starts_with("npm ") || c.starts_with("git ")
            });
            let kind_is_prefix_relevant = matches!(kind, PromptType::Password | PromptType::Confirmation);
            if prefix_matches && kind_is_prefix_relevant {
                (base + 0.1).min(1.0)
            } else {
                base
            }
        };

        if lower.contains("password") || lower.contains("passphrase") || lower.contains("secret") {
            return Some(Detection {
                pattern_name: "heuristic_credential_keyword".to_string(),
                kind: PromptType::Password,
                matched_text: last_line.to_string(),
                mask_input: true,
                suggested_response: None,
                confidence: bump(PromptType::Password, 0.9),
            });
        }

        if lower.contains("[y/n]") || lower.contains("(y/n)") || lower.contains("[n/y]") || lower.contains("(n/y)") {
            return Some(Detection {
                pattern_name: "heuristic_yn_bracket".to_string(),
                kind: PromptType::Confirmation,
                matched_text: last_line.to_string(),
                mask_input: false,
                suggested_response: Some("y".to_string()),
                confidence: bump(PromptType::Confirmation, 0.95),
            });
        }

        if lower.contains("press enter") || lower.contains("continue?") || lower.contains("proceed?") || lower.contains("are you sure") {
            return Some(Detection {
                pattern_name: "heuristic_confirmation_phrase".to_string(),
                kind: PromptType::Confirmation,
                matched_text: last_line.to_string(),
                mask_input: false,
                suggested_response: None,
                confidence: bump(PromptType::Confirmation, 0.8),
            });
        }

        let is_shell_prompt = last_line.ends_with("$ ") || last_line.ends_with("# ") || last_line.ends_with("> ");
        let ends_colon_or_question = last_line.ends_with(':') || last_line.ends_with('?');
        if ends_colon_or_question && last_line.len() < 100 && !last_line.contains('\t') && !is_shell_prompt {
            return Some(Detection {
                pattern_name: "heuristic_trailing_prompt".to_string(),
                kind: PromptType::Text,
                matched_text: last_line.to_string(),
                mask_input: false,
                suggested_response: None,
                confidence: bump(PromptType::Text, 0.6),
            });
        }

        None
    }
}
