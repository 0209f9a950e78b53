//! Reply generation for assistant messages.

use std::future::Future;
use std::pin::Pin;

use crate::sync::core::errors::SyncResult;
use crate::sync::core::ids::ConversationId;
use crate::sync::core::model::Message;

/// Boxed future type for reply generators.
pub type ReplyFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces the content of the assistant message that follows a user message.
pub trait ReplyGenerator: Send + Sync {
    /// Generate a reply from the confirmed history of a conversation.
    ///
    /// # Errors
    /// Returns [`crate::sync::SyncError::Reply`] if no reply can be produced.
    fn generate_reply<'a>(
        &'a self,
        conversation: ConversationId,
        history: &'a [Message],
    ) -> ReplyFuture<'a, SyncResult<String>>;
}

/// Always answers with the same text.
#[derive(Clone, Debug)]
pub struct CannedReply {
    text: String,
}

impl CannedReply {
    /// Reply with `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for CannedReply {
    fn default() -> Self {
        Self::new(crate::sync::core::config::DEFAULT_CANNED_REPLY)
    }
}

impl ReplyGenerator for CannedReply {
    fn generate_reply<'a>(
        &'a self,
        _conversation: ConversationId,
        _history: &'a [Message],
    ) -> ReplyFuture<'a, SyncResult<String>> {
        Box::pin(async move { Ok(self.text.clone()) })
    }
}
