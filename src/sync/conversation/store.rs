//! Conversation collection and active pointer of one identity.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::state::StoreState;
use super::stream::{LoadOutcome, MessageStream};
use crate::sync::backend::Backend;
use crate::sync::core::errors::{SyncError, SyncResult};
use crate::sync::core::ids::{ConversationId, UserId};
use crate::sync::core::model::{Conversation, Message};
use crate::sync::reply::ReplyGenerator;

/// Owns the conversations of one identity and the single active pointer.
///
/// Built on sign-in and cleared on sign-out; results of calls still in flight
/// when the store is cleared are dropped.
pub struct ConversationStore {
    owner: UserId,
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<StoreState>>,
    stream: MessageStream,
}

impl ConversationStore {
    /// Create an empty store for `owner`.
    #[must_use]
    pub fn new(owner: UserId, backend: Arc<dyn Backend>, reply: Arc<dyn ReplyGenerator>) -> Self {
        let state = Arc::new(RwLock::new(StoreState::default()));
        let stream = MessageStream::new(Arc::clone(&backend), reply, Arc::clone(&state));
        Self {
            owner,
            backend,
            state,
            stream,
        }
    }

    /// Identity owning this store.
    #[must_use]
    pub const fn owner(&self) -> UserId {
        self.owner
    }

    /// Message stream of the active conversation.
    #[must_use]
    pub const fn stream(&self) -> &MessageStream {
        &self.stream
    }

    /// Snapshot of the conversations, newest first.
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    /// The active conversation, if any.
    pub async fn active(&self) -> Option<Conversation> {
        let state = self.state.read().await;
        let id = state.active?;
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    /// Snapshot of the active conversation's messages.
    pub async fn messages(&self) -> Vec<Message> {
        self.stream.messages().await
    }

    /// Replace the collection with the owner's conversations, newest first.
    ///
    /// # Errors
    /// Returns the backend error; the previous collection is kept.
    pub async fn fetch_all(&self) -> SyncResult<LoadOutcome> {
        let epoch = self.state.read().await.epoch;
        let result = self.backend.list_conversations(self.owner).await;

        let mut conversations = match result {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!(owner = %self.owner, error = %err, "Failed to fetch conversations");
                return Err(err.into());
            }
        };
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            debug!(owner = %self.owner, "Discarding conversations fetched before sign-out");
            return Ok(LoadOutcome::Discarded);
        }
        let count = conversations.len();
        state.conversations = conversations;
        debug!(owner = %self.owner, count, "Conversations loaded");
        Ok(LoadOutcome::Applied(count))
    }

    /// Create a conversation and put it first, without activating it.
    ///
    /// # Errors
    /// Returns the backend error; nothing changes locally.
    pub async fn create(&self, title: &str) -> SyncResult<Conversation> {
        let epoch = self.state.read().await.epoch;
        let conversation = match self.backend.create_conversation(self.owner, title).await {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(owner = %self.owner, error = %err, "Failed to create conversation");
                return Err(err.into());
            }
        };

        let mut state = self.state.write().await;
        if state.epoch == epoch {
            state.conversations.insert(0, conversation.clone());
            info!(id = %conversation.id, title = %conversation.title, "Conversation created");
        } else {
            debug!(id = %conversation.id, "Conversation created after sign-out, not kept");
        }
        Ok(conversation)
    }

    /// Make a conversation active and load its messages.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] for an unknown id (pointer unchanged), or
    /// the backend error from loading messages (pointer set, list empty).
    pub async fn select(&self, id: ConversationId) -> SyncResult<LoadOutcome> {
        let version = {
            let mut state = self.state.write().await;
            if !state.conversations.iter().any(|c| c.id == id) {
                return Err(SyncError::NotFound(id.to_string()));
            }
            state.activate(Some(id))
        };
        debug!(%id, version, "Conversation selected");
        self.stream.load_tagged(id, version, &HashSet::new()).await
    }

    /// Change the title of a conversation in place.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] for an unknown id, or the backend error.
    pub async fn rename(&self, id: ConversationId, title: &str) -> SyncResult<Conversation> {
        let epoch = {
            let state = self.state.read().await;
            if !state.conversations.iter().any(|c| c.id == id) {
                return Err(SyncError::NotFound(id.to_string()));
            }
            state.epoch
        };
        let renamed = match self.backend.rename_conversation(id, title).await {
            Ok(renamed) => renamed,
            Err(err) => {
                warn!(%id, error = %err, "Failed to rename conversation");
                return Err(err.into());
            }
        };

        let mut state = self.state.write().await;
        if state.epoch == epoch {
            if let Some(slot) = state.conversations.iter_mut().find(|c| c.id == id) {
                *slot = renamed.clone();
            }
        }
        info!(%id, title = %renamed.title, "Conversation renamed");
        Ok(renamed)
    }

    /// Delete a conversation; clears the pointer and messages if it was active.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] for an unknown id, or the backend error
    /// (collection unchanged).
    pub async fn delete(&self, id: ConversationId) -> SyncResult<()> {
        let epoch = {
            let state = self.state.read().await;
            if !state.conversations.iter().any(|c| c.id == id) {
                return Err(SyncError::NotFound(id.to_string()));
            }
            state.epoch
        };
        if let Err(err) = self.backend.delete_conversation(id).await {
            warn!(%id, error = %err, "Failed to delete conversation");
            return Err(err.into());
        }

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return Ok(());
        }
        state.conversations.retain(|c| c.id != id);
        if state.active == Some(id) {
            state.activate(None);
        }
        info!(%id, "Conversation deleted");
        Ok(())
    }

    /// Drop every conversation, the pointer and the messages.
    ///
    /// Late results of calls started before the clear are not applied.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.conversations.clear();
        state.activate(None);
        state.epoch += 1;
        debug!(owner = %self.owner, "Conversation store cleared");
    }
}
