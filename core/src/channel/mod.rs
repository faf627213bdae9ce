//! Terminal channel capability (C1): a raw, unframed byte stream to either a
//! local PTY shell or a remote SSH shell, generalized from the teacher's
//! `ShellSession` trait so the command executor can be written once against
//! either transport.

pub mod local;
pub mod remote;

use std::io;
use std::time::Instant;

use async_trait::async_trait;

/// Signals deliverable to the remote process. Window-change is not a
/// variant here: it carries a row/col pair that `signal()` has no room for,
/// so it's delivered through `resize()` instead, which both channels
/// already implement for exactly that purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
}

#[async_trait]
pub trait TerminalChannel: Send + Sync {
    /// Reads whatever bytes are currently available, blocking up to the
    /// channel's configured read deadline before returning `Ok(0)`.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, data: &[u8]) -> io::Result<usize>;

    async fn write_string(&self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes()).await
    }

    async fn resize(&self, rows: u16, cols: u16) -> io::Result<()>;

    async fn signal(&self, kind: SignalKind) -> io::Result<()>;

    /// Bounds how long the next `read` call may block. `None` clears any
    /// previously set deadline (read returns as soon as data is available or
    /// the channel's own poll interval elapses).
    async fn set_read_deadline(&self, deadline: Option<Instant>);

    fn is_alive(&self) -> bool;

    async fn close(&self) -> io::Result<()>;
}
