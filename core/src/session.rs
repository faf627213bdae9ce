//! A single stateful, restartable command-execution endpoint (C4):
//! one terminal channel, one executor, one prompt detector, tracked through
//! an explicit `idle -> running -> awaiting_input -> idle` state machine.
//! Grounded on the teacher's `ShellSession` trait, generalized so the same
//! struct drives both local and SSH channels instead of duplicating the
//! marker loop once per transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::channel::TerminalChannel;
use crate::clock::Clock;
use crate::error::{SessionError, SessionResult};
use crate::executor::{ExecResult, ExecStatus, Executor, OutputChunk};
use crate::metadata::SessionKind;
use crate::policy::CommandPolicy;
use crate::prompt::PromptDetector;
use crate::random::Random;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    AwaitingInput,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub id: String,
    pub kind: SessionKind,
    pub description: Option<String>,
    /// Present only for SSH sessions.
    pub host: Option<String>,
    pub user: Option<String>,
    pub state: State,
    pub cwd: Option<String>,
    /// Absolute path to the shell binary. `None` for SSH sessions, whose
    /// remote shell is never probed.
    pub shell: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
    /// `Clock.now() - last_used_at`, truncated to whole seconds (§8 P6).
    pub idle_for: chrono::Duration,
    /// Opaque, passed through untouched for the out-of-scope tunnel layer.
    pub saved_tunnels: Vec<String>,
}

impl Status {
    /// `{h}h{m}m{s}s` dropping leading zero components, e.g. `5s`, `3m12s`,
    /// `1h00m05s`. Used by CLI listings; not itself part of the tested
    /// contract (only `idle_for`'s second-precision value is, per P6).
    pub fn idle_for_humanized(&self) -> String {
        let total = self.idle_for.num_seconds().max(0);
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;
        if hours > 0 {
            format!("{hours}h{minutes:02}m{seconds:02}s")
        } else if minutes > 0 {
            format!("{minutes}m{seconds:02}s")
        } else {
            format!("{seconds}s")
        }
    }
}

/// Parameters that describe a session at creation time but never change
/// afterward, bundled so `Session::new` doesn't grow a parameter for every
/// attribute spec §3 adds to the session record.
#[derive(Debug, Clone, Default)]
pub struct SessionInit {
    pub description: Option<String>,
    /// Present only for SSH sessions.
    pub host: Option<String>,
    pub user: Option<String>,
    /// Absolute path to the shell binary; resolved once at spawn time for
    /// local sessions, left `None` for SSH sessions.
    pub shell: Option<String>,
    /// Opaque, carried through untouched for the out-of-scope tunnel layer
    /// to reattach after recovery.
    pub saved_tunnels: Vec<String>,
    pub initial_cwd: Option<String>,
}

pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub description: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub shell: Option<String>,
    pub saved_tunnels: Vec<String>,
    channel: Arc<dyn TerminalChannel>,
    executor: Arc<Executor>,
    detector: Arc<PromptDetector>,
    policy: Arc<CommandPolicy>,
    random: Arc<dyn Random>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    cwd: Mutex<Option<String>>,
    created_at: chrono::DateTime<chrono::Utc>,
    last_used_at: Mutex<chrono::DateTime<chrono::Utc>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        kind: SessionKind,
        channel: Arc<dyn TerminalChannel>,
        detector: Arc<PromptDetector>,
        policy: Arc<CommandPolicy>,
        random: Arc<dyn Random>,
        clock: Arc<dyn Clock>,
        init: SessionInit,
    ) -> Self {
        let now = clock.now_utc();
        Self {
            id,
            kind,
            description: init.description,
            host: init.host,
            user: init.user,
            shell: init.shell,
            saved_tunnels: init.saved_tunnels,
            channel,
            executor: Arc::new(Executor::new()),
            detector,
            policy,
            random,
            clock,
            state: Mutex::new(State::Idle),
            cwd: Mutex::new(init.initial_cwd),
            created_at: now,
            last_used_at: Mutex::new(now),
        }
    }

    pub async fn status(&self) -> Status {
        let last_used_at = *self.last_used_at.lock().await;
        let idle_for = chrono::Duration::seconds(self.clock.now_utc().signed_duration_since(last_used_at).num_seconds());
        Status {
            id: self.id.clone(),
            kind: self.kind,
            description: self.description.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            state: *self.state.lock().await,
            cwd: self.cwd.lock().await.clone(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            last_used_at,
            idle_for,
            saved_tunnels: self.saved_tunnels.clone(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> SessionResult<ExecResult> {
        {
            let state = *self.state.lock().await;
            if state == State::AwaitingInput {
                return Err(SessionError::ValidationFailed(
                    "session is awaiting input; call respond() instead of exec()".into(),
                ));
            }
            if state == State::Closed {
                return Err(SessionError::SessionNotFound(self.id.clone()));
            }
        }
        if let Err(reason) = self.policy.check(command) {
            return Err(SessionError::CommandBlocked(reason));
        }
        *self.state.lock().await = State::Running;
        let result = self
            .executor
            .exec(
                self.channel.as_ref(),
                &self.detector,
                self.random.as_ref(),
                self.clock.as_ref(),
                command,
                timeout,
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                *self.state.lock().await = State::Idle;
                return Err(e);
            }
        };
        self.apply_result(&result).await;
        Ok(result)
    }

    pub async fn respond(&self, input: &str, mask_input: bool, timeout: Duration) -> SessionResult<ExecResult> {
        {
            let state = *self.state.lock().await;
            if state != State::AwaitingInput {
                return Err(SessionError::ValidationFailed(
                    "no command is awaiting input on this session".into(),
                ));
            }
        }
        let result = self
            .executor
            .respond(self.channel.as_ref(), &self.detector, self.clock.as_ref(), input, mask_input, timeout)
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                *self.state.lock().await = State::Idle;
                return Err(e);
            }
        };
        self.apply_result(&result).await;
        Ok(result)
    }

    /// Like `exec`, but streams output deltas as they arrive. The returned
    /// join handle resolves to the same `ExecResult` `exec()` would have
    /// returned, and also drives this session's state transition once it
    /// completes.
    pub async fn exec_streaming(
        self: &Arc<Self>,
        command: String,
        timeout: Duration,
    ) -> SessionResult<(
        tokio::sync::mpsc::Receiver<OutputChunk>,
        tokio::task::JoinHandle<SessionResult<ExecResult>>,
    )> {
        {
            let state = *self.state.lock().await;
            if state == State::AwaitingInput {
                return Err(SessionError::ValidationFailed(
                    "session is awaiting input; call respond() instead of exec_streaming()".into(),
                ));
            }
            if state == State::Closed {
                return Err(SessionError::SessionNotFound(self.id.clone()));
            }
        }
        if let Err(reason) = self.policy.check(&command) {
            return Err(SessionError::CommandBlocked(reason));
        }
        *self.state.lock().await = State::Running;

        let (rx, inner_handle) = self.executor.clone().execute_streaming(
            self.channel.clone(),
            self.detector.clone(),
            self.random.clone(),
            self.clock.clone(),
            command,
            timeout,
        );

        let session = self.clone();
        let handle = tokio::spawn(async move {
            match inner_handle.await {
                Ok(Ok(result)) => {
                    session.apply_result(&result).await;
                    Ok(result)
                }
                Ok(Err(e)) => {
                    *session.state.lock().await = State::Idle;
                    Err(e)
                }
                Err(e) => {
                    *session.state.lock().await = State::Idle;
                    Err(SessionError::IoFailed(e.to_string()))
                }
            }
        });
        Ok((rx, handle))
    }

    pub async fn interrupt(&self) -> SessionResult<()> {
        self.executor.interrupt(self.channel.as_ref()).await?;
        *self.state.lock().await = State::Idle;
        Ok(())
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> SessionResult<()> {
        self.channel
            .resize(rows, cols)
            .await
            .map_err(|e| SessionError::IoFailed(e.to_string()))
    }

    pub async fn close(&self) -> SessionResult<()> {
        *self.state.lock().await = State::Closed;
        self.channel
            .close()
            .await
            .map_err(|e| SessionError::IoFailed(e.to_string()))
    }

    async fn apply_result(&self, result: &ExecResult) {
        *self.last_used_at.lock().await = self.clock.now_utc();
        if let Some(cwd) = &result.cwd {
            *self.cwd.lock().await = Some(cwd.clone());
        }
        let next = match result.status {
            ExecStatus::AwaitingInput => State::AwaitingInput,
            ExecStatus::Completed | ExecStatus::TimedOut => State::Idle,
            ExecStatus::ChannelClosed => State::Closed,
        };
        *self.state.lock().await = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::config::PromptDetectionConfig;
    use crate::random::fake::FakeRandom;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    struct ScriptedChannel {
        to_read: StdMutex<VecDeque<Vec<u8>>>,
        written: StdMutex<Vec<u8>>,
        alive: StdMutex<bool>,
    }

    impl ScriptedChannel {
        fn new() -> Self {
            Self {
                to_read: StdMutex::new(VecDeque::new()),
                written: StdMutex::new(Vec::new()),
                alive: StdMutex::new(true),
            }
        }

        fn push_on_write(&self, chunk: Vec<u8>) {
            #[allow(clippy::unwrap_used)]
            self.to_read.lock().unwrap().push_back(chunk);
        }
    }

    #[async_trait]
    impl TerminalChannel for ScriptedChannel {
        async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            #[allow(clippy::unwrap_used)]
            let mut queue = self.to_read.lock().unwrap();
            if let Some(chunk) = queue.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            } else {
                Ok(0)
            }
        }

        async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
            #[allow(clippy::unwrap_used)]
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        async fn resize(&self, _rows: u16, _cols: u16) -> std::io::Result<()> {
            Ok(())
        }

        async fn signal(&self, _kind: crate::channel::SignalKind) -> std::io::Result<()> {
            Ok(())
        }

        async fn set_read_deadline(&self, _deadline: Option<Instant>) {}

        fn is_alive(&self) -> bool {
            #[allow(clippy::unwrap_used)]
            {
                *self.alive.lock().unwrap()
            }
        }

        async fn close(&self) -> std::io::Result<()> {
            #[allow(clippy::unwrap_used)]
            {
                *self.alive.lock().unwrap() = false;
            }
            Ok(())
        }
    }

    fn make_session(channel: ScriptedChannel) -> Session {
        #[allow(clippy::expect_used)]
        let detector = Arc::new(PromptDetector::new(&PromptDetectionConfig::default()).expect("compiles"));
        #[allow(clippy::expect_used)]
        let policy = Arc::new(CommandPolicy::compile(&[], &[]).expect("compiles"));
        Session::new(
            "sess_0000000000000000".to_string(),
            SessionKind::Local,
            Arc::new(channel),
            detector,
            policy,
            Arc::new(FakeRandom::new()),
            Arc::new(FakeClock::new()),
            SessionInit::default(),
        )
    }

    #[tokio::test]
    async fn exec_while_idle_runs_and_times_out_without_terminator() {
        let channel = ScriptedChannel::new();
        let session = make_session(channel);
        let result = session
            .exec("echo hi", Duration::from_millis(50))
            .await
            .unwrap_or_else(|e| panic!("exec failed: {e}"));
        assert_eq!(result.status, ExecStatus::TimedOut);
        assert_eq!(session.status().await.state, State::Idle);
    }

    /// §8 P6: `idle_for` equals `Clock.now() - last_used_at`, second-precision.
    #[tokio::test]
    async fn idle_for_tracks_the_injected_clock() {
        let channel = ScriptedChannel::new();
        #[allow(clippy::expect_used)]
        let detector = Arc::new(PromptDetector::new(&PromptDetectionConfig::default()).expect("compiles"));
        #[allow(clippy::expect_used)]
        let policy = Arc::new(CommandPolicy::compile(&[], &[]).expect("compiles"));
        let clock = Arc::new(FakeClock::new());
        let session = Session::new(
            "sess_0000000000000000".to_string(),
            SessionKind::Local,
            Arc::new(channel),
            detector,
            policy,
            Arc::new(FakeRandom::new()),
            clock.clone(),
            SessionInit::default(),
        );
        assert_eq!(session.status().await.idle_for, chrono::Duration::seconds(0));
        clock.advance(Duration::from_secs(42));
        assert_eq!(session.status().await.idle_for, chrono::Duration::seconds(42));
    }

    #[tokio::test]
    async fn respond_without_pending_input_is_rejected() {
        let channel = ScriptedChannel::new();
        let session = make_session(channel);
        let result = session.respond("yes", false, Duration::from_millis(10)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exec_of_a_blocklisted_command_never_touches_the_channel() {
        let channel = ScriptedChannel::new();
        #[allow(clippy::expect_used)]
        let detector = Arc::new(PromptDetector::new(&PromptDetectionConfig::default()).expect("compiles"));
        #[allow(clippy::expect_used)]
        let policy = Arc::new(CommandPolicy::compile(&["^rm\\s+-rf".to_string()], &[]).expect("compiles"));
        let session = Session::new(
            "sess_0000000000000000".to_string(),
            SessionKind::Local,
            Arc::new(channel),
            detector,
            policy,
            Arc::new(FakeRandom::new()),
            Arc::new(FakeClock::new()),
            SessionInit::default(),
        );
        let result = session.exec("rm -rf /", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SessionError::CommandBlocked(_))));
        assert_eq!(session.status().await.state, State::Idle);
    }

    /// §3 / §4.4: host, user, shell, and saved_tunnels are carried from
    /// creation through into `Status` untouched.
    #[tokio::test]
    async fn status_reports_the_init_supplied_attributes() {
        let channel = ScriptedChannel::new();
        #[allow(clippy::expect_used)]
        let detector = Arc::new(PromptDetector::new(&PromptDetectionConfig::default()).expect("compiles"));
        #[allow(clippy::expect_used)]
        let policy = Arc::new(CommandPolicy::compile(&[], &[]).expect("compiles"));
        let session = Session::new(
            "sess_0000000000000000".to_string(),
            SessionKind::Ssh,
            Arc::new(channel),
            detector,
            policy,
            Arc::new(FakeRandom::new()),
            Arc::new(FakeClock::new()),
            SessionInit {
                host: Some("example.com".to_string()),
                user: Some("alice".to_string()),
                saved_tunnels: vec!["8080:localhost:8080".to_string()],
                ..Default::default()
            },
        );
        let status = session.status().await;
        assert_eq!(status.host.as_deref(), Some("example.com"));
        assert_eq!(status.user.as_deref(), Some("alice"));
        assert_eq!(status.shell, None);
        assert_eq!(status.saved_tunnels, vec!["8080:localhost:8080".to_string()]);
    }

    #[tokio::test]
    async fn exec_on_closed_session_is_rejected() {
        let channel = ScriptedChannel::new();
        let session = make_session(channel);
        session.close().await.unwrap_or_else(|e| panic!("close failed: {e}"));
        let result = session.exec("echo hi", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound(_))));
    }
}
