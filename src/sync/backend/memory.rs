//! In-process backend built on concurrent maps.
//!
//! Useful for local runs and as a test double: every operation can be told to
//! fail once through [`InMemoryBackend::fail_next`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{Backend, BackendFuture};
use crate::sync::core::errors::{BackendError, BackendResult};
use crate::sync::core::ids::{ConversationId, MessageId, UserId};
use crate::sync::core::model::{
    BlobUpload, ClientState, Conversation, Message, NewMessage, Profile,
};

/// Backend operations, used to target injected failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BackendOp {
    /// `get_profile`.
    GetProfile,
    /// `create_profile`.
    CreateProfile,
    /// `list_conversations`.
    ListConversations,
    /// `create_conversation`.
    CreateConversation,
    /// `rename_conversation`.
    RenameConversation,
    /// `delete_conversation`.
    DeleteConversation,
    /// `list_messages`.
    ListMessages,
    /// `create_message`.
    CreateMessage,
    /// `upload_blob`.
    UploadBlob,
}

#[derive(Clone, Debug)]
struct StoredConversation {
    seq: u64,
    record: Conversation,
}

/// Backend keeping every table in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    profiles: DashMap<UserId, Profile>,
    conversations: DashMap<ConversationId, StoredConversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
    blobs: DashMap<String, Vec<u8>>,
    failures: DashMap<BackendOp, String>,
    seq: AtomicU64,
    clock_ms: AtomicI64,
}

impl InMemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `reason`.
    pub fn fail_next(&self, op: BackendOp, reason: impl Into<String>) {
        self.failures.insert(op, reason.into());
    }

    /// Number of stored profiles.
    #[must_use]
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Number of stored messages in a conversation.
    #[must_use]
    pub fn message_count(&self, conversation: ConversationId) -> usize {
        self.messages.get(&conversation).map_or(0, |m| m.len())
    }

    /// Bytes stored under a public URL.
    #[must_use]
    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.get(url).map(|b| b.clone())
    }

    fn check(&self, op: BackendOp) -> BackendResult<()> {
        match self.failures.remove(&op) {
            Some((_, reason)) => Err(BackendError::Injected(reason)),
            None => Ok(()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Strictly increasing timestamps, so records never tie.
    fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let mut last = self.clock_ms.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .clock_ms
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return DateTime::from_timestamp_millis(next).unwrap_or_else(Utc::now),
                Err(actual) => last = actual,
            }
        }
    }
}

impl Backend for InMemoryBackend {
    fn get_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Option<Profile>>> {
        Box::pin(async move {
            self.check(BackendOp::GetProfile)?;
            Ok(self.profiles.get(&id).map(|p| p.clone()))
        })
    }

    fn create_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Profile>> {
        Box::pin(async move {
            self.check(BackendOp::CreateProfile)?;
            let profile = Profile::empty(id, self.tick());
            match self.profiles.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    Err(BackendError::Conflict(format!("profile {id} already exists")))
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(profile.clone());
                    Ok(profile)
                }
            }
        })
    }

    fn list_conversations(
        &self,
        owner: UserId,
    ) -> BackendFuture<'_, BackendResult<Vec<Conversation>>> {
        Box::pin(async move {
            self.check(BackendOp::ListConversations)?;
            let mut rows: Vec<StoredConversation> = self
                .conversations
                .iter()
                .filter(|c| c.record.owner_id == owner)
                .map(|c| c.value().clone())
                .collect();
            rows.sort_by(|a, b| {
                b.record
                    .created_at
                    .cmp(&a.record.created_at)
                    .then(b.seq.cmp(&a.seq))
            });
            Ok(rows.into_iter().map(|c| c.record).collect())
        })
    }

    fn create_conversation(
        &self,
        owner: UserId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        let title = title.to_string();
        Box::pin(async move {
            self.check(BackendOp::CreateConversation)?;
            let now = self.tick();
            let record = Conversation {
                id: ConversationId::new(),
                owner_id: owner,
                title,
                created_at: now,
                updated_at: now,
            };
            self.conversations.insert(
                record.id,
                StoredConversation {
                    seq: self.next_seq(),
                    record: record.clone(),
                },
            );
            Ok(record)
        })
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        let title = title.to_string();
        Box::pin(async move {
            self.check(BackendOp::RenameConversation)?;
            let now = self.tick();
            let mut stored = self
                .conversations
                .get_mut(&id)
                .ok_or_else(|| BackendError::Missing(format!("conversation {id}")))?;
            stored.record.title = title;
            stored.record.updated_at = now;
            Ok(stored.record.clone())
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> BackendFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.check(BackendOp::DeleteConversation)?;
            self.conversations.remove(&id);
            self.messages.remove(&id);
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation: ConversationId,
    ) -> BackendFuture<'_, BackendResult<Vec<Message>>> {
        Box::pin(async move {
            self.check(BackendOp::ListMessages)?;
            Ok(self
                .messages
                .get(&conversation)
                .map(|m| m.clone())
                .unwrap_or_default())
        })
    }

    fn create_message(&self, message: NewMessage) -> BackendFuture<'_, BackendResult<Message>> {
        Box::pin(async move {
            self.check(BackendOp::CreateMessage)?;
            if !self.conversations.contains_key(&message.conversation_id) {
                return Err(BackendError::Missing(format!(
                    "conversation {}",
                    message.conversation_id
                )));
            }
            let record = Message {
                id: MessageId::new(),
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                attachment: message.attachment,
                created_at: self.tick(),
                client_state: ClientState::Confirmed,
            };
            self.messages
                .entry(record.conversation_id)
                .or_default()
                .push(record.clone());
            Ok(record)
        })
    }

    fn upload_blob(&self, upload: BlobUpload) -> BackendFuture<'_, BackendResult<String>> {
        Box::pin(async move {
            self.check(BackendOp::UploadBlob)?;
            let url = format!(
                "memory://blobs/{}/{}.{}",
                upload.owner,
                self.next_seq(),
                upload.extension()
            );
            self.blobs.insert(url.clone(), upload.bytes);
            Ok(url)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::core::model::{AttachmentKind, Role};

    #[tokio::test]
    async fn test_conversations_listed_newest_first() {
        let backend = InMemoryBackend::new();
        let owner = UserId::new();
        let first = backend.create_conversation(owner, "a").await.unwrap();
        let second = backend.create_conversation(owner, "b").await.unwrap();
        backend.create_conversation(UserId::new(), "other").await.unwrap();

        let listed = backend.list_conversations(owner).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_create_profile_conflicts_on_duplicate() {
        let backend = InMemoryBackend::new();
        let id = UserId::new();
        backend.create_profile(id).await.unwrap();
        assert!(matches!(
            backend.create_profile(id).await,
            Err(BackendError::Conflict(_))
        ));
        assert_eq!(backend.profile_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let backend = InMemoryBackend::new();
        let conversation = backend.create_conversation(UserId::new(), "t").await.unwrap();
        backend
            .create_message(NewMessage {
                conversation_id: conversation.id,
                role: Role::User,
                content: "hi".to_string(),
                attachment: None,
            })
            .await
            .unwrap();
        assert_eq!(backend.message_count(conversation.id), 1);

        backend.delete_conversation(conversation.id).await.unwrap();
        assert_eq!(backend.message_count(conversation.id), 0);
        assert!(backend.list_messages(conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_for_unknown_conversation_is_rejected() {
        let backend = InMemoryBackend::new();
        let result = backend
            .create_message(NewMessage {
                conversation_id: ConversationId::new(),
                role: Role::User,
                content: "hi".to_string(),
                attachment: None,
            })
            .await;
        assert!(matches!(result, Err(BackendError::Missing(_))));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let backend = InMemoryBackend::new();
        let owner = UserId::new();
        backend.fail_next(BackendOp::ListConversations, "offline");
        assert!(backend.list_conversations(owner).await.is_err());
        assert!(backend.list_conversations(owner).await.is_ok());
    }

    #[tokio::test]
    async fn test_uploaded_blob_is_retrievable() {
        let backend = InMemoryBackend::new();
        let url = backend
            .upload_blob(BlobUpload {
                owner: UserId::new(),
                bytes: vec![1, 2, 3],
                kind: AttachmentKind::File,
                content_type: "text/plain".to_string(),
                file_name: "notes.txt".to_string(),
            })
            .await
            .unwrap();
        assert!(url.ends_with(".txt"));
        assert_eq!(backend.blob(&url), Some(vec![1, 2, 3]));
    }
}
