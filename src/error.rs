//! Error types for the collection engine.
//!
//! [`ConnectError`] covers everything that can go wrong while reaching a
//! device and running commands on it. [`CollectError`] covers the run-level
//! concerns around it: configuration, artifact persistence and metadata.

use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors raised while connecting to a device or executing commands on it.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The jump host could not be reached or its transport died.
    ///
    /// No device is reachable without it, so this aborts the whole run.
    #[error("jump host failure: {0}")]
    JumpHost(String),

    /// TCP/SSH transport to the device failed (refused, reset, unreachable).
    #[error("transport error: {0}")]
    Transport(String),

    /// The device rejected the supplied credentials.
    ///
    /// Never retried automatically.
    #[error("authentication failed for {0}")]
    Auth(String),

    /// The device presented a host key the configured policy does not
    /// accept. Never retried.
    #[error("host key rejected for {0}")]
    HostKeyRejected(String),

    /// The device accepted the connection but no prompt was seen in time.
    #[error("timed out waiting for initial prompt: {0}")]
    InitTimeout(String),

    /// Command execution timed out.
    ///
    /// The error contains the partial output received before the timeout.
    #[error("exec command timeout: {0}")]
    ExecTimeout(String),

    /// The SSH channel was disconnected while waiting for a prompt.
    #[error("channel disconnect on wait prompt")]
    ChannelDisconnectError,

    /// The session has been closed.
    #[error("connect closed")]
    ConnectClosedError,

    /// The run was cancelled before this operation could complete.
    #[error("cancelled")]
    Cancelled,

    /// The device failed earlier in this run and is not attempted again.
    #[error("device {device} previously failed: {reason}")]
    DeviceFailed {
        device: String,
        kind: FailureKind,
        reason: String,
    },

    /// Prompt handler regexes did not compile.
    #[error("invalid prompt handler config: {0}")]
    InvalidPromptConfig(String),

    /// A recorded session had no output for the requested command.
    #[error("replay mismatch: {0}")]
    ReplayMismatchError(String),

    /// Internal invariant violated (lock poisoned, pool inconsistency).
    #[error("internal error: {0}")]
    InternalServerError(String),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// Failed to send data to the shell I/O task.
    #[error("Failed to send data: {0}")]
    SendDataError(#[from] SendError<String>),
}

/// Coarse classification of a connection failure, used for reporting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Auth,
    Timeout,
    JumpHost,
    Cancelled,
    Rejected,
    Internal,
}

impl ConnectError {
    /// Whether reconnecting may succeed.
    ///
    /// Authentication and jump host failures are never retryable. Timeouts
    /// are retryable; callers bound them separately from transport retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Transport(_)
                | ConnectError::InitTimeout(_)
                | ConnectError::ExecTimeout(_)
                | ConnectError::ChannelDisconnectError
                | ConnectError::ConnectClosedError
                | ConnectError::RusshError(_)
        )
    }

    /// Whether the error poisons the whole run rather than one device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::JumpHost(_))
    }

    /// Reporting class of this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ConnectError::JumpHost(_) => FailureKind::JumpHost,
            ConnectError::Auth(_) | ConnectError::HostKeyRejected(_) => FailureKind::Auth,
            ConnectError::InitTimeout(_) | ConnectError::ExecTimeout(_) => FailureKind::Timeout,
            ConnectError::Cancelled => FailureKind::Cancelled,
            ConnectError::DeviceFailed { kind, .. } => *kind,
            ConnectError::Transport(_)
            | ConnectError::ChannelDisconnectError
            | ConnectError::ConnectClosedError
            | ConnectError::RusshError(_) => FailureKind::Transport,
            ConnectError::ReplayMismatchError(_) => FailureKind::Rejected,
            ConnectError::InvalidPromptConfig(_)
            | ConnectError::InternalServerError(_)
            | ConnectError::SendDataError(_) => FailureKind::Internal,
        }
    }
}

/// Errors raised by the run-level machinery around the sessions.
#[derive(Error, Debug)]
pub enum CollectError {
    /// Configuration or catalog could not be parsed or is inconsistent.
    #[error("invalid config: {0}")]
    Config(String),

    /// Filesystem failure while persisting artifacts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Temporary artifact could not be renamed into place.
    #[error("persist error: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// TOML catalog or config failed to parse.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The connection layer failed in a way the run cannot absorb.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Internal invariant violated (lock poisoned, join failure).
    #[error("internal error: {0}")]
    Internal(String),
}
