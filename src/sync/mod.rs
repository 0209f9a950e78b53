//! Conversation and message synchronization core.
//!
//! [`session::SessionBinding`] follows the signed-in identity and owns one
//! [`conversation::ConversationStore`] per sign-in. The store keeps the
//! identity's conversations and the active pointer; its
//! [`conversation::MessageStream`] holds the active conversation's messages and
//! sends new ones optimistically. [`attachment::AttachmentPipeline`] turns a
//! recording or a file into an [`Attachment`] that can ride along with a
//! message. Every remote call goes through [`backend::Backend`].

pub mod attachment;
pub mod backend;
pub mod conversation;
pub mod core;
pub mod reply;
pub mod services;
pub mod session;

pub use attachment::{AttachmentPipeline, Microphone, NoMicrophone, PipelineState};
pub use backend::{Backend, InMemoryBackend, RestBackend, SqliteBackend};
pub use conversation::{ConversationStore, LoadOutcome, MessageStream, SendReceipt};
pub use self::core::{
    Attachment, AttachmentKind, BackendError, ConversationId, Conversation, DeviceError, Message,
    MessageId, Role, SyncConfig, SyncError, SyncResult, UserId,
};
pub use reply::{CannedReply, ReplyGenerator};
pub use services::SyncServices;
pub use session::{SessionBinding, SessionTask, ensure_profile};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
