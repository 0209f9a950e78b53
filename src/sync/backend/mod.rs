//! Backend contract and adapters.
//!
//! The core never talks to a service directly; every persistence, storage and
//! profile call goes through [`Backend`].

use std::future::Future;
use std::pin::Pin;

use crate::sync::core::errors::BackendResult;
use crate::sync::core::ids::{ConversationId, UserId};
use crate::sync::core::model::{BlobUpload, Conversation, Message, NewMessage, Profile};

pub mod memory;
pub mod rest;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::{BackendOp, InMemoryBackend};
pub use rest::RestBackend;
pub use sqlite::SqliteBackend;

/// Boxed future type for backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request/response interface to the persistence, storage and profile service.
pub trait Backend: Send + Sync {
    /// Fetch the profile of an identity, if any.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn get_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Option<Profile>>>;

    /// Create an empty profile for an identity.
    ///
    /// # Errors
    /// Returns an error if the service call fails or the profile already exists.
    fn create_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Profile>>;

    /// List conversations owned by `owner`, newest first.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn list_conversations(
        &self,
        owner: UserId,
    ) -> BackendFuture<'_, BackendResult<Vec<Conversation>>>;

    /// Create a conversation; the backend assigns id and timestamps.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn create_conversation(
        &self,
        owner: UserId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>>;

    /// Change a conversation title.
    ///
    /// # Errors
    /// Returns an error if the service call fails or the conversation is unknown.
    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>>;

    /// Delete a conversation and its messages.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn delete_conversation(&self, id: ConversationId) -> BackendFuture<'_, BackendResult<()>>;

    /// List messages of a conversation, oldest first.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn list_messages(
        &self,
        conversation: ConversationId,
    ) -> BackendFuture<'_, BackendResult<Vec<Message>>>;

    /// Persist a message; the backend assigns id and timestamp.
    ///
    /// # Errors
    /// Returns an error if the service call fails.
    fn create_message(&self, message: NewMessage) -> BackendFuture<'_, BackendResult<Message>>;

    /// Store a blob and return its public URL.
    ///
    /// # Errors
    /// Returns an error if the upload fails.
    fn upload_blob(&self, upload: BlobUpload) -> BackendFuture<'_, BackendResult<String>>;
}
