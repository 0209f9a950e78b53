use crate::sync::core::ids::ConversationId;
use crate::sync::core::model::{Conversation, Message};

/// State shared by a conversation store and its message stream.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    /// Conversations, newest first.
    pub(crate) conversations: Vec<Conversation>,
    /// Active conversation pointer.
    pub(crate) active: Option<ConversationId>,
    /// Bumped whenever the active pointer changes or the store is cleared.
    pub(crate) version: u64,
    /// Messages of the active conversation.
    pub(crate) messages: Vec<Message>,
    /// Bumped when the store is cleared on sign-out.
    pub(crate) epoch: u64,
}

impl StoreState {
    /// Whether a result tagged with `(conversation, version)` may still be applied.
    pub(crate) fn is_current(&self, conversation: ConversationId, version: u64) -> bool {
        self.version == version && self.active == Some(conversation)
    }

    /// Point at `conversation` (or nothing) and drop the previous messages.
    pub(crate) fn activate(&mut self, conversation: Option<ConversationId>) -> u64 {
        self.version += 1;
        self.active = conversation;
        self.messages.clear();
        self.version
    }
}
