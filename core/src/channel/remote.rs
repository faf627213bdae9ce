//! SSH-backed terminal channel.
//!
//! Mirrors the teacher's `RemoteShellSession`: connect with an accept-any
//! host-key handler (host-key pinning is out of scope here, same caveat the
//! teacher carries), authenticate by password or public key, open a session
//! channel, request a PTY and an interactive shell, then treat the channel
//! like any other raw byte stream.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Sig};
use tokio::sync::Mutex as AsyncMutex;

use super::{SignalKind, TerminalChannel};
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConnection {
    pub username: String,
    pub hostname: String,
    pub port: u16,
}

/// Splits `user@host[:port]`, defaulting to port 22.
pub fn parse_connection_string(s: &str) -> SessionResult<ParsedConnection> {
    let (username, rest) = s
        .split_once('@')
        .ok_or_else(|| SessionError::ValidationFailed(format!("{s:?} is missing a username (expected user@host)")))?;
    if username.is_empty() || rest.is_empty() {
        return Err(SessionError::ValidationFailed(format!("{s:?} is not a valid connection string")));
    }
    let (hostname, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| SessionError::ValidationFailed(format!("{port_str:?} is not a valid port")))?;
            (host.to_string(), port)
        }
        _ => (rest.to_string(), 22),
    };
    Ok(ParsedConnection {
        username: username.to_string(),
        hostname,
        port,
    })
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

struct AcceptAllHostKeys;

impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct RemoteAuth<'a> {
    pub password: Option<&'a str>,
    pub private_key_path: Option<&'a str>,
}

/// The underlying SSH connection (transport + auth), shared across every
/// channel (session) opened against the same host so that N sessions to one
/// host cost one TCP/SSH handshake instead of N.
pub struct ControlSession {
    pub parsed: ParsedConnection,
    handle: Handle<AcceptAllHostKeys>,
}

impl ControlSession {
    pub async fn connect(connection_string: &str, auth: RemoteAuth<'_>) -> SessionResult<Self> {
        let parsed = parse_connection_string(connection_string)?;
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, (parsed.hostname.as_str(), parsed.port), AcceptAllHostKeys)
            .await
            .map_err(|e| SessionError::ChannelSetupFailed(format!("connect {}:{}: {e}", parsed.hostname, parsed.port)))?;

        let authenticated = if let Some(password) = auth.password {
            session
                .authenticate_password(&parsed.username, password)
                .await
                .map_err(|e| SessionError::ChannelSetupFailed(format!("password auth: {e}")))?
        } else {
            let key_path = auth
                .private_key_path
                .map(PathBuf::from)
                .or_else(|| default_key_files().into_iter().find(|p| p.exists()))
                .ok_or_else(|| SessionError::ChannelSetupFailed("no private key available and no password supplied".into()))?;
            let key_pair = russh::keys::load_secret_key(&key_path, None)
                .map_err(|e| SessionError::ChannelSetupFailed(format!("loading key {}: {e}", key_path.display())))?;
            session
                .authenticate_publickey(
                    &parsed.username,
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), Some(russh::keys::HashAlg::Sha256)),
                )
                .await
                .map_err(|e| SessionError::ChannelSetupFailed(format!("public key auth: {e}")))?
        };
        if !matches!(authenticated, russh::client::AuthResult::Success) {
            return Err(SessionError::ChannelSetupFailed("ssh authentication rejected".into()));
        }

        Ok(Self { parsed, handle: session })
    }

    /// Tears down the shared transport. Manager-owned: individual
    /// `RemoteChannel`s never call this, only `CloseAll`/pool eviction.
    pub async fn close(&self) -> SessionResult<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(|e| SessionError::IoFailed(format!("ssh disconnect: {e}")))
    }
}

pub struct RemoteChannel {
    channel: Arc<AsyncMutex<russh::Channel<client::Msg>>>,
    _control: Arc<ControlSession>,
    pending: Arc<AsyncMutex<VecDeque<u8>>>,
    read_deadline: Arc<AsyncMutex<Option<Instant>>>,
    alive: Arc<AtomicBool>,
}

impl RemoteChannel {
    /// Opens a new shell channel on an already-authenticated control
    /// session. Multiple `RemoteChannel`s may share the same `ControlSession`.
    pub async fn open(control: Arc<ControlSession>, rows: u16, cols: u16) -> SessionResult<Self> {
        let mut channel = control
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::ChannelSetupFailed(format!("channel_open_session: {e}")))?;
        channel
            .request_pty(true, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
            .await
            .map_err(|e| SessionError::ChannelSetupFailed(format!("request_pty: {e}")))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| SessionError::ChannelSetupFailed(format!("request_shell: {e}")))?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(Self {
            channel: Arc::new(AsyncMutex::new(channel)),
            _control: control,
            pending: Arc::new(AsyncMutex::new(VecDeque::new())),
            read_deadline: Arc::new(AsyncMutex::new(None)),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[async_trait]
impl TerminalChannel for RemoteChannel {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut pending = self.pending.lock().await;
            if !pending.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    let Some(byte) = pending.pop_front() else {
                        break;
                    };
                    buf[n] = byte;
                    n += 1;
                }
                return Ok(n);
            }
        }

        let deadline = *self.read_deadline.lock().await;
        let mut channel = self.channel.lock().await;
        loop {
            let msg = if let Some(dl) = deadline {
                let remaining = dl.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, channel.wait()).await {
                    Ok(Some(m)) => m,
                    Ok(None) => {
                        self.alive.store(false, Ordering::SeqCst);
                        return Ok(0);
                    }
                    Err(_) => return Ok(0),
                }
            } else {
                match channel.wait().await {
                    Some(m) => m,
                    None => {
                        self.alive.store(false, Ordering::SeqCst);
                        return Ok(0);
                    }
                }
            };
            match msg {
                ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if data.len() > n {
                        let mut pending = self.pending.lock().await;
                        pending.extend(data[n..].iter().copied());
                    }
                    return Ok(n);
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    self.alive.store(false, Ordering::SeqCst);
                    return Ok(0);
                }
                _ => continue,
            }
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let channel = self.channel.lock().await;
        channel.data(data).await.map_err(io::Error::other)?;
        Ok(data.len())
    }

    async fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let channel = self.channel.lock().await;
        channel
            .window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(io::Error::other)
    }

    async fn signal(&self, kind: SignalKind) -> io::Result<()> {
        let channel = self.channel.lock().await;
        match kind {
            SignalKind::Interrupt => channel.signal(Sig::INT).await.map_err(io::Error::other),
            SignalKind::Terminate => channel.signal(Sig::TERM).await.map_err(io::Error::other),
        }
    }

    async fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut guard = self.read_deadline.lock().await;
        *guard = deadline;
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        let channel = self.channel.lock().await;
        channel.close().await.map_err(io::Error::other)
    }
}
