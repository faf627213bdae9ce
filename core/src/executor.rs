//! Command execution over a `TerminalChannel` (C3).
//!
//! Generalizes the teacher's marker-based command-boundary protocol
//! (`MARKER_PREFIX`/`MARKER_SUFFIX`, echoed back after each command) into a
//! nonce-keyed sentinel line that also carries the exit status and working
//! directory, so callers get a real exit code instead of the teacher's
//! hard-coded `None`. Output cleaning (stripping the echoed command, the
//! sentinel line itself, and ANSI escapes) follows `clean_shell_output`.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::TerminalChannel;
use crate::clock::Clock;
use crate::error::{SessionError, SessionResult};
use crate::prompt::{Detection, PromptDetector};
use crate::random::{hex_token, Random};

pub(crate) const SENTINEL_PREFIX: &str = "__CSM_CMD_END_";
pub(crate) const SENTINEL_SUFFIX: &str = "__";
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    AwaitingInput,
    TimedOut,
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    /// Everything the command printed to the terminal. A PTY merges stdout
    /// and stderr into one stream, so there is no way to split them back
    /// apart here; `stderr` is always empty and exists only so callers that
    /// serialize this against the external stdout/stderr schema don't need
    /// a special case.
    pub stdout: String,
    pub stderr: String,
    pub cwd: Option<String>,
    pub duration: Duration,
    pub prompt: Option<Detection>,
    pub truncated: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        matches!(self.status, ExecStatus::Completed) && matches!(self.exit_code, Some(0) | None)
    }
}

/// One delta of a streamed command's output. `is_final` marks the chunk
/// accompanying the returned `ExecResult` (which may itself be empty, if the
/// receiver already saw every byte via earlier chunks).
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub text: String,
    pub is_final: bool,
}

pub(crate) fn sentinel_command(nonce: &str) -> String {
    format!(
        "__csm_status=$?; printf '\\n{p}%s:%s:%s{s}\\n' \"{nonce}\" \"$__csm_status\" \"$PWD\"",
        p = SENTINEL_PREFIX,
        s = SENTINEL_SUFFIX,
        nonce = nonce,
    )
}

fn sentinel_regex(nonce: &str) -> regex::Regex {
    let pattern = format!(
        "{}{}:(-?[0-9]+):(.*?){}",
        regex::escape(SENTINEL_PREFIX),
        regex::escape(nonce),
        regex::escape(SENTINEL_SUFFIX)
    );
    #[allow(clippy::expect_used)]
    regex::Regex::new(&pattern).expect("sentinel regex built from escaped literals must compile")
}

/// Strips the echoed input line, the sentinel line itself, and trailing
/// blank lines, leaving just what the command printed to the terminal.
fn clean_output(raw: &str, command: &str, nonce: &str) -> String {
    let stripped = console::strip_ansi_codes(raw);
    let command_echo_prefix = command.lines().next().unwrap_or("").trim();
    stripped
        .lines()
        .filter(|line| !line.contains(nonce))
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed == command_echo_prefix && !command_echo_prefix.is_empty())
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

struct Pending {
    nonce: String,
    command: String,
    buffer: String,
    deadline_started_at: std::time::Instant,
    truncated: bool,
}

pub struct Executor {
    pending: tokio::sync::Mutex<Option<Pending>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            pending: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn awaiting_input(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    pub async fn exec(
        &self,
        channel: &dyn TerminalChannel,
        detector: &PromptDetector,
        random: &dyn Random,
        clock: &dyn Clock,
        command: &str,
        timeout: Duration,
    ) -> SessionResult<ExecResult> {
        self.exec_with_stream(channel, detector, random, clock, command, timeout, None).await
    }

    async fn exec_with_stream(
        &self,
        channel: &dyn TerminalChannel,
        detector: &PromptDetector,
        random: &dyn Random,
        clock: &dyn Clock,
        command: &str,
        timeout: Duration,
        stream: Option<&tokio::sync::mpsc::Sender<OutputChunk>>,
    ) -> SessionResult<ExecResult> {
        let mut guard = self.pending.lock().await;
        if guard.is_some() {
            return Err(SessionError::ValidationFailed(
                "session is awaiting input for a previous command; call respond() instead".into(),
            ));
        }
        let nonce = hex_token(random, 8);
        let wire = format!("{}\n{}\n", command.trim_end_matches('\n'), sentinel_command(&nonce));
        channel
            .write_string(&wire)
            .await
            .map_err(|e| SessionError::IoFailed(e.to_string()))?;

        let mut pending = Pending {
            nonce,
            command: command.to_string(),
            buffer: String::new(),
            deadline_started_at: clock.now_instant(),
            truncated: false,
        };
        let result = self.drive(channel, detector, &mut pending, timeout, stream).await?;
        if matches!(result.status, ExecStatus::AwaitingInput) {
            *guard = Some(pending);
        }
        Ok(result)
    }

    /// Like `exec`, but also streams output deltas over the returned
    /// channel as they arrive instead of only at completion. Spawns its own
    /// task, so the caller gets the receiver back immediately; await the
    /// join handle for the final `ExecResult`.
    pub fn execute_streaming(
        self: Arc<Self>,
        channel: Arc<dyn TerminalChannel>,
        detector: Arc<PromptDetector>,
        random: Arc<dyn Random>,
        clock: Arc<dyn Clock>,
        command: String,
        timeout: Duration,
    ) -> (
        tokio::sync::mpsc::Receiver<OutputChunk>,
        tokio::task::JoinHandle<SessionResult<ExecResult>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let handle = tokio::spawn(async move {
            self.exec_with_stream(
                channel.as_ref(),
                detector.as_ref(),
                random.as_ref(),
                clock.as_ref(),
                &command,
                timeout,
                Some(&tx),
            )
            .await
        });
        (rx, handle)
    }

    pub async fn respond(
        &self,
        channel: &dyn TerminalChannel,
        detector: &PromptDetector,
        clock: &dyn Clock,
        input: &str,
        mask_input: bool,
        timeout: Duration,
    ) -> SessionResult<ExecResult> {
        let mut guard = self.pending.lock().await;
        let mut pending = guard
            .take()
            .ok_or_else(|| SessionError::ValidationFailed("no command is awaiting input".into()))?;

        if mask_input {
            tracing::debug!(target: "csm_core::executor", nonce = %pending.nonce, "writing masked response");
        } else {
            tracing::debug!(target: "csm_core::executor", nonce = %pending.nonce, input = %input, "writing response");
        }
        channel
            .write_string(&format!("{input}\n"))
            .await
            .map_err(|e| SessionError::IoFailed(e.to_string()))?;
        pending.deadline_started_at = clock.now_instant();

        let result = self.drive(channel, detector, &mut pending, timeout, None).await?;
        if matches!(result.status, ExecStatus::AwaitingInput) {
            *guard = Some(pending);
        }
        Ok(result)
    }

    pub async fn interrupt(&self, channel: &dyn TerminalChannel) -> SessionResult<()> {
        channel
            .signal(crate::channel::SignalKind::Interrupt)
            .await
            .map_err(|e| SessionError::IoFailed(e.to_string()))?;
        let mut guard = self.pending.lock().await;
        *guard = None;
        Ok(())
    }

    async fn drive(
        &self,
        channel: &dyn TerminalChannel,
        detector: &PromptDetector,
        pending: &mut Pending,
        timeout: Duration,
        stream: Option<&tokio::sync::mpsc::Sender<OutputChunk>>,
    ) -> SessionResult<ExecResult> {
        let deadline = pending.deadline_started_at + timeout;
        channel.set_read_deadline(Some(deadline)).await;

        let terminator = sentinel_regex(&pending.nonce);
        let mut occurrences_of_nonce = 0usize;
        let mut buf = [0u8; 8192];
        let mut last_sent_len = 0usize;

        macro_rules! send_final {
            () => {
                if let Some(tx) = stream {
                    let cleaned = clean_output(&pending.buffer, &pending.command, &pending.nonce);
                    let tail = cleaned.get(last_sent_len.min(cleaned.len())..).unwrap_or("").to_string();
                    let _ = tx.send(OutputChunk { text: tail, is_final: true }).await;
                }
            };
        }

        loop {
            if std::time::Instant::now() >= deadline {
                channel.set_read_deadline(None).await;
                // The sentinel printed (we've seen its nonce at least twice:
                // PTY echo + actual output) but never parsed as a terminator,
                // so this isn't an ordinary timeout — the protocol itself drifted.
                if occurrences_of_nonce >= 2 && terminator.captures(&pending.buffer).is_none() {
                    tracing::warn!(
                        target: "csm_core::executor",
                        nonce = %pending.nonce,
                        "sentinel nonce observed twice but terminator never matched"
                    );
                    return Err(SessionError::ProtocolDrift(pending.nonce.clone()));
                }
                send_final!();
                return Ok(ExecResult {
                    status: ExecStatus::TimedOut,
                    exit_code: None,
                    stdout: clean_output(&pending.buffer, &pending.command, &pending.nonce),
                    stderr: String::new(),
                    cwd: None,
                    duration: timeout,
                    prompt: None,
                    truncated: pending.truncated,
                });
            }

            let n = channel
                .read(&mut buf)
                .await
                .map_err(|e| SessionError::IoFailed(e.to_string()))?;
            if n == 0 {
                if !channel.is_alive() {
                    channel.set_read_deadline(None).await;
                    send_final!();
                    return Ok(ExecResult {
                        status: ExecStatus::ChannelClosed,
                        exit_code: None,
                        stdout: clean_output(&pending.buffer, &pending.command, &pending.nonce),
                        stderr: String::new(),
                        cwd: None,
                        duration: std::time::Instant::now().saturating_duration_since(pending.deadline_started_at),
                        prompt: None,
                        truncated: pending.truncated,
                    });
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let chunk = String::from_utf8_lossy(&buf[..n]);
            occurrences_of_nonce += chunk.matches(pending.nonce.as_str()).count();
            if pending.buffer.len() + chunk.len() > MAX_OUTPUT_BYTES {
                let remaining = MAX_OUTPUT_BYTES.saturating_sub(pending.buffer.len());
                pending.buffer.push_str(&chunk[..remaining.min(chunk.len())]);
                pending.truncated = true;
            } else {
                pending.buffer.push_str(&chunk);
            }

            if let Some(tx) = stream {
                let cleaned = clean_output(&pending.buffer, &pending.command, &pending.nonce);
                if cleaned.len() > last_sent_len {
                    let tail = cleaned[last_sent_len..].to_string();
                    last_sent_len = cleaned.len();
                    let _ = tx.send(OutputChunk { text: tail, is_final: false }).await;
                }
            }

            // The echoed command line never matches `terminator`: the PTY
            // echoes the literal printf format string (`...END_%s:%s:%s...`),
            // not the nonce substituted into it, so prefix-immediately-
            // followed-by-nonce only matches the line the shell actually
            // prints. Matching unconditionally (rather than waiting for a
            // second sighting of the nonce) also makes this correct across a
            // `respond()` resume, where the echo was already consumed by the
            // earlier `drive()` call that returned `AwaitingInput` and this
            // call's local `occurrences_of_nonce` only ever reaches 1.
            if let Some(captures) = terminator.captures(&pending.buffer) {
                let exit_code = captures.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
                let cwd = captures.get(2).map(|m| m.as_str().trim().to_string());
                channel.set_read_deadline(None).await;
                let stdout = clean_output(&pending.buffer, &pending.command, &pending.nonce);
                send_final!();
                return Ok(ExecResult {
                    status: ExecStatus::Completed,
                    exit_code,
                    stdout,
                    stderr: String::new(),
                    cwd,
                    duration: std::time::Instant::now().saturating_duration_since(pending.deadline_started_at),
                    prompt: None,
                    truncated: pending.truncated,
                });
            }

            if let Some(detection) = detector.detect_with_command(&pending.buffer, Some(&pending.command)) {
                channel.set_read_deadline(None).await;
                send_final!();
                return Ok(ExecResult {
                    status: ExecStatus::AwaitingInput,
                    exit_code: None,
                    stdout: clean_output(&pending.buffer, &pending.command, &pending.nonce),
                    stderr: String::new(),
                    cwd: None,
                    duration: std::time::Instant::now().saturating_duration_since(pending.deadline_started_at),
                    prompt: Some(detection),
                    truncated: pending.truncated,
                });
            }
        }
    }
}
