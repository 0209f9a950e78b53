//! Error types for the synchronization core.

use thiserror::Error;

use crate::sync::core::ids::MessageId;

/// Failure reported by a backend adapter (transport, auth, server or storage).
#[derive(Debug, Error)]
pub enum BackendError {
    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success HTTP status returned by the service.
    #[error("backend returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, kept for display.
        body: String,
    },
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O error while touching blob storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The service answered with a payload the client cannot interpret.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// A record the request depends on does not exist on the backend.
    #[error("record not found: {0}")]
    Missing(String),
    /// A record with the same identity already exists.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Failure injected by a test double.
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Result alias for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failure acquiring or driving the capture device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or the platform denied access to the microphone.
    #[error("microphone permission denied")]
    PermissionDenied,
    /// No usable capture device.
    #[error("microphone unavailable: {0}")]
    Unavailable(String),
    /// The device failed while recording or finalizing.
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Error taxonomy of the synchronization core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport, auth or server failure from the backend.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// Referenced conversation is absent from local state.
    #[error("conversation not found: {0}")]
    NotFound(String),
    /// A message was sent while no conversation is active.
    #[error("no active conversation")]
    NoActiveConversation,
    /// The attachment pipeline already has an attachment in flight.
    #[error("attachment pipeline is busy")]
    Busy,
    /// Microphone unavailable or denied.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// Capture stop requested while nothing is recording.
    #[error("no capture in progress")]
    NotCapturing,
    /// Attachment rejected before upload.
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),
    /// The reply generator failed.
    #[error("reply generation failed: {0}")]
    Reply(String),
    /// No failed message with this placeholder id in the active stream.
    #[error("no failed message {0} in the active conversation")]
    MessageNotFound(MessageId),
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for core operations.
pub type SyncResult<T> = Result<T, SyncError>;
