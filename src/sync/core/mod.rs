//! Core types: configuration, errors, identifiers and records.

pub mod config;
pub mod errors;
pub mod ids;
pub mod model;

pub use config::{
    AttachmentConfig, BackendConfig, BackendKind, OllamaConfig, ReplyConfig, ReplyMode,
    RestConfig, SqliteConfig, SyncConfig,
};
pub use errors::{BackendError, BackendResult, DeviceError, SyncError, SyncResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use model::{
    Attachment, AttachmentKind, BlobUpload, ClientState, Conversation, Message, NewMessage,
    Profile, Role,
};
