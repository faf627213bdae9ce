//! Local PTY-backed terminal channel.
//!
//! Follows the teacher's `LocalShellSession`: resolve the user's shell from
//! `$SHELL` (falling back to `/bin/sh`), open a PTY via `portable_pty`, spawn
//! the shell interactively against the slave side, and read/write the master
//! side. Blocking PTY I/O is pushed onto `spawn_blocking` so the async
//! executor never stalls a worker thread on it.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::{SignalKind, TerminalChannel};
use crate::error::{SessionError, SessionResult};

const POLL_INTERVAL: Duration = Duration::from_millis(30);
const INTR_BYTE: u8 = 0x03;

struct Inner {
    writer: Box<dyn Write + Send>,
    reader: Option<Box<dyn Read + Send>>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    alive: bool,
}

pub struct LocalChannel {
    inner: Arc<Mutex<Inner>>,
    read_deadline: Arc<Mutex<Option<Instant>>>,
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Resolves the shell a local session will run, the same way `spawn` does,
/// so callers that need to know it up front (recorded on `Session` for
/// `Status`) don't duplicate the fallback logic.
pub(crate) fn resolve_shell(shell_path: Option<&str>) -> String {
    shell_path.map(str::to_string).unwrap_or_else(default_shell)
}

/// Last path component, lowercased, so `/usr/local/bin/bash` and `bash`
/// both resolve to the same flavor.
fn shell_flavor(shell: &str) -> &'static str {
    let name = shell.rsplit('/').next().unwrap_or(shell).to_lowercase();
    match name.as_str() {
        "bash" => "bash",
        "zsh" => "zsh",
        "fish" => "fish",
        _ => "sh",
    }
}

/// Per-shell flags that suppress rc/profile loading when
/// `shell.source_rc = false`, per spec §4.1/§6. POSIX `sh` takes none.
fn rc_suppression_args(flavor: &str) -> &'static [&'static str] {
    match flavor {
        "bash" => &["--norc", "--noprofile"],
        "zsh" => &["--no-rcs", "--no-globalrcs"],
        "fish" => &["--no-config"],
        _ => &[],
    }
}

impl LocalChannel {
    pub fn spawn(shell_path: Option<&str>, source_rc: bool, rows: u16, cols: u16) -> SessionResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ChannelSetupFailed(format!("openpty: {e}")))?;

        let shell = resolve_shell(shell_path);
        let flavor = shell_flavor(&shell);
        let mut cmd = CommandBuilder::new(&shell);
        cmd.arg("-i");
        if !source_rc {
            for flag in rc_suppression_args(flavor) {
                cmd.arg(flag);
            }
        }
        // Keep the interactive shell's own banner/rc noise, color codes, and
        // hook-driven output out of the sentinel-scanning loop.
        cmd.env("TERM", "dumb");
        cmd.env("NO_COLOR", "1");
        match flavor {
            "zsh" => {
                cmd.env("PROMPT", "$ ");
                cmd.env("PS1", "$ ");
                cmd.env("RPROMPT", "");
                cmd.env("precmd_functions", "");
            }
            "fish" => {
                cmd.env("fish_greeting", "");
            }
            _ => {
                cmd.env("PS1", "$ ");
                cmd.env("PROMPT_COMMAND", "");
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::ChannelSetupFailed(format!("spawn {shell}: {e}")))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::ChannelSetupFailed(format!("take_writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::ChannelSetupFailed(format!("clone_reader: {e}")))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                writer,
                reader: Some(reader),
                master: pair.master,
                child,
                alive: true,
            })),
            read_deadline: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl TerminalChannel for LocalChannel {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = {
            #[allow(clippy::unwrap_used)]
            let guard = self.read_deadline.lock().unwrap();
            *guard
        };
        let inner = self.inner.clone();
        let len = buf.len();
        let (n, reader, data) = tokio::task::spawn_blocking(move || {
            #[allow(clippy::unwrap_used)]
            let mut guard = inner.lock().unwrap();
            let Some(mut reader) = guard.reader.take() else {
                return (0usize, None, Vec::new());
            };
            drop(guard);

            let mut scratch = vec![0u8; len.max(4096)];
            loop {
                match reader.read(&mut scratch) {
                    Ok(0) => return (0, Some(reader), Vec::new()),
                    Ok(n) => return (n, Some(reader), scratch[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Some(dl) = deadline {
                            if Instant::now() >= dl {
                                return (0, Some(reader), Vec::new());
                            }
                        }
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    Err(_) => return (0, Some(reader), Vec::new()),
                }
            }
        })
        .await
        .unwrap_or((0, None, Vec::new()));

        if let Some(reader) = reader {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.inner.lock().unwrap();
            guard.reader = Some(reader);
        }
        let n = n.min(buf.len()).min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let inner = self.inner.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            #[allow(clippy::unwrap_used)]
            let mut guard = inner.lock().unwrap();
            guard.writer.write_all(&data)?;
            guard.writer.flush()?;
            Ok(data.len())
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
    }

    async fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        #[allow(clippy::unwrap_used)]
        let guard = self.inner.lock().unwrap();
        guard
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(io::Error::other)
    }

    async fn signal(&self, kind: SignalKind) -> io::Result<()> {
        match kind {
            SignalKind::Interrupt => self.write(&[INTR_BYTE]).await.map(|_| ()),
            SignalKind::Terminate => {
                #[allow(clippy::unwrap_used)]
                let mut guard = self.inner.lock().unwrap();
                guard.child.kill()
            }
        }
    }

    async fn set_read_deadline(&self, deadline: Option<Instant>) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.read_deadline.lock().unwrap();
        *guard = deadline;
    }

    fn is_alive(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        if !guard.alive {
            return false;
        }
        match guard.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => {
                guard.alive = false;
                false
            }
            Err(_) => false,
        }
    }

    async fn close(&self) -> io::Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.lock().unwrap();
        guard.alive = false;
        let _ = guard.child.kill();
        Ok(())
    }
}
