//! Message sequence of the active conversation.
//!
//! Sends append a pending placeholder before any network call and the
//! confirmation replaces that slot in place, so a message never moves once
//! inserted. Every mutation is tagged with the active pointer's version and
//! dropped if the pointer changed while the call was in flight. A load that
//! lands after local sends keeps those entries after the loaded records.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::state::StoreState;
use crate::sync::backend::Backend;
use crate::sync::core::errors::{SyncError, SyncResult};
use crate::sync::core::ids::{ConversationId, MessageId};
use crate::sync::core::model::{Attachment, ClientState, Message, Role};
use crate::sync::reply::ReplyGenerator;

/// Result of a load whose response may have gone stale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    /// The response replaced local state; carries the number of records.
    Applied(usize),
    /// The response arrived after the target changed and was dropped.
    Discarded,
}

/// Confirmed records produced by one send.
#[derive(Clone, Debug)]
pub struct SendReceipt {
    /// The confirmed user message.
    pub user: Message,
    /// The confirmed assistant reply, absent if the conversation was switched
    /// before the reply could be appended.
    pub assistant: Option<Message>,
}

/// Ordered messages of the active conversation.
pub struct MessageStream {
    backend: Arc<dyn Backend>,
    reply: Arc<dyn ReplyGenerator>,
    state: Arc<RwLock<StoreState>>,
}

impl MessageStream {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        reply: Arc<dyn ReplyGenerator>,
        state: Arc<RwLock<StoreState>>,
    ) -> Self {
        Self {
            backend,
            reply,
            state,
        }
    }

    /// Conversation the stream currently follows.
    pub async fn conversation(&self) -> Option<ConversationId> {
        self.state.read().await.active
    }

    /// Snapshot of the messages, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Reload the messages of the active conversation.
    ///
    /// Pending and failed entries are kept after the reloaded records.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] if `conversation` is not the active one,
    /// or the backend error; only unconfirmed entries are left on failure.
    pub async fn load(&self, conversation: ConversationId) -> SyncResult<LoadOutcome> {
        let (version, replaced) = {
            let state = self.state.read().await;
            if state.active != Some(conversation) {
                return Err(SyncError::NotFound(conversation.to_string()));
            }
            let replaced = state
                .messages
                .iter()
                .filter(|m| m.is_confirmed())
                .map(|m| m.id)
                .collect();
            (state.version, replaced)
        };
        self.load_tagged(conversation, version, &replaced).await
    }

    /// Load `conversation` for the pointer `version`.
    ///
    /// `replaced` holds the confirmed entries the response supersedes; every
    /// other local entry was appended after the request and is kept.
    pub(crate) async fn load_tagged(
        &self,
        conversation: ConversationId,
        version: u64,
        replaced: &HashSet<MessageId>,
    ) -> SyncResult<LoadOutcome> {
        let result = self.backend.list_messages(conversation).await;

        let mut state = self.state.write().await;
        if !state.is_current(conversation, version) {
            debug!(%conversation, "Discarding stale message load");
            return Ok(LoadOutcome::Discarded);
        }
        let local = std::mem::take(&mut state.messages);
        match result {
            Ok(messages) => {
                let count = messages.len();
                state.messages = merge_loaded(messages, local, replaced);
                debug!(%conversation, count, "Messages loaded");
                Ok(LoadOutcome::Applied(count))
            }
            Err(err) => {
                state.messages = merge_loaded(Vec::new(), local, replaced);
                warn!(%conversation, error = %err, "Failed to load messages");
                Err(err.into())
            }
        }
    }

    /// Send a user message, then append the assistant reply.
    ///
    /// # Errors
    /// Returns [`SyncError::NoActiveConversation`] if no conversation is
    /// selected, the backend error if a message cannot be persisted (the entry
    /// stays in the list marked failed), or the reply generator error.
    pub async fn send(
        &self,
        content: &str,
        attachment: Option<Attachment>,
    ) -> SyncResult<SendReceipt> {
        let (conversation, version, placeholder) = self
            .append_pending(Role::User, content.to_string(), attachment)
            .await?;
        let user = self.persist(version, placeholder).await?;

        let history = {
            let state = self.state.read().await;
            if !state.is_current(conversation, version) {
                debug!(%conversation, "Conversation switched, skipping reply");
                return Ok(SendReceipt {
                    user,
                    assistant: None,
                });
            }
            state
                .messages
                .iter()
                .filter(|m| m.is_confirmed())
                .cloned()
                .collect::<Vec<_>>()
        };

        let reply = match self.reply.generate_reply(conversation, &history).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%conversation, error = %err, "Reply generation failed");
                return Err(err);
            }
        };

        let placeholder = {
            let mut state = self.state.write().await;
            if !state.is_current(conversation, version) {
                debug!(%conversation, "Conversation switched, dropping reply");
                return Ok(SendReceipt {
                    user,
                    assistant: None,
                });
            }
            let placeholder = Message::pending(conversation, Role::Assistant, reply, None);
            state.messages.push(placeholder.clone());
            placeholder
        };
        let assistant = self.persist(version, placeholder).await?;

        Ok(SendReceipt {
            user,
            assistant: Some(assistant),
        })
    }

    /// Re-issue the create request of a failed message, in place.
    ///
    /// # Errors
    /// Returns [`SyncError::MessageNotFound`] if no failed entry has this id,
    /// or the backend error if the retry fails again.
    pub async fn retry(&self, placeholder: MessageId) -> SyncResult<Message> {
        let (version, message) = {
            let mut state = self.state.write().await;
            let version = state.version;
            let slot = state
                .messages
                .iter_mut()
                .find(|m| m.id == placeholder && m.is_failed())
                .ok_or(SyncError::MessageNotFound(placeholder))?;
            slot.client_state = ClientState::Pending;
            (version, slot.clone())
        };
        debug!(%placeholder, "Retrying message");
        self.persist(version, message).await
    }

    /// Remove a failed message from the list.
    ///
    /// # Errors
    /// Returns [`SyncError::MessageNotFound`] if no failed entry has this id.
    pub async fn discard(&self, placeholder: MessageId) -> SyncResult<Message> {
        let mut state = self.state.write().await;
        let index = state
            .messages
            .iter()
            .position(|m| m.id == placeholder && m.is_failed())
            .ok_or(SyncError::MessageNotFound(placeholder))?;
        debug!(%placeholder, "Discarding failed message");
        Ok(state.messages.remove(index))
    }

    async fn append_pending(
        &self,
        role: Role,
        content: String,
        attachment: Option<Attachment>,
    ) -> SyncResult<(ConversationId, u64, Message)> {
        let mut state = self.state.write().await;
        let conversation = state.active.ok_or(SyncError::NoActiveConversation)?;
        let placeholder = Message::pending(conversation, role, content, attachment);
        state.messages.push(placeholder.clone());
        Ok((conversation, state.version, placeholder))
    }

    /// Persist a pending entry and reconcile its slot with the outcome.
    async fn persist(&self, version: u64, placeholder: Message) -> SyncResult<Message> {
        let result = self
            .backend
            .create_message(placeholder.to_new_message())
            .await;

        let mut state = self.state.write().await;
        let slot = state
            .messages
            .iter()
            .position(|m| m.id == placeholder.id)
            .filter(|_| state.is_current(placeholder.conversation_id, version));

        match result {
            Ok(mut record) => {
                record.client_state = ClientState::Confirmed;
                let loaded = state.messages.iter().any(|m| m.id == record.id);
                match slot {
                    // A load that landed meanwhile already holds the record.
                    Some(index) if loaded => {
                        state.messages.remove(index);
                    }
                    Some(index) => state.messages[index] = record.clone(),
                    None => debug!(id = %record.id, "Confirmation for a cleared stream"),
                }
                Ok(record)
            }
            Err(err) => {
                if let Some(index) = slot {
                    state.messages[index].client_state = ClientState::Failed {
                        reason: err.to_string(),
                    };
                }
                warn!(
                    conversation = %placeholder.conversation_id,
                    role = %placeholder.role,
                    error = %err,
                    "Failed to persist message"
                );
                Err(err.into())
            }
        }
    }
}

/// Loaded records first, then the local entries the response does not cover.
fn merge_loaded(
    loaded: Vec<Message>,
    local: Vec<Message>,
    replaced: &HashSet<MessageId>,
) -> Vec<Message> {
    let ids: HashSet<MessageId> = loaded.iter().map(|m| m.id).collect();
    let mut merged = loaded;
    merged.extend(local.into_iter().filter(|m| {
        !m.is_confirmed() || !(replaced.contains(&m.id) || ids.contains(&m.id))
    }));
    merged
}
