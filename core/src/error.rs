//! Error kinds surfaced at the core boundary.
//!
//! One variant per error kind named in the design (ConfigInvalid through
//! CloseAggregate), mirroring the flat `thiserror` enums the rest of the
//! codebase uses for subsystem errors (session/task managers included).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("max sessions reached ({0})")]
    QuotaExceeded(usize),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("channel setup failed: {0}")]
    ChannelSetupFailed(String),

    #[error("io failed: {0}")]
    IoFailed(String),

    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("command blocked by policy: {0}")]
    CommandBlocked(String),

    #[error("protocol drift: terminator sentinel not found despite clean completion ({0})")]
    ProtocolDrift(String),

    #[error("close errors: {0}")]
    CloseAggregate(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
