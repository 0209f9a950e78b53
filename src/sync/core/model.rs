//! Records exchanged between the core and its backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::core::ids::{ConversationId, MessageId, UserId};

/// Author role of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Written by the signed-in identity.
    User,
    /// Produced by the reply generator.
    Assistant,
}

impl Role {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// Kind of uploaded attachment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Recorded audio.
    Audio,
    /// User-selected file.
    File,
}

impl AttachmentKind {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            _ => Err(value.to_string()),
        }
    }
}

/// A completed upload referenced by a message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Public URL of the stored blob.
    pub url: String,
    /// Attachment kind.
    pub kind: AttachmentKind,
    /// Display name.
    pub name: String,
}

/// Local lifecycle of a message.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClientState {
    /// Appended locally, waiting for the backend.
    Pending,
    /// Acknowledged by the backend.
    #[default]
    Confirmed,
    /// The create request failed; kept in place until retried or discarded.
    Failed {
        /// Error reported by the backend.
        reason: String,
    },
}

/// A conversation owned by one identity.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Backend-assigned identifier.
    pub id: ConversationId,
    /// Owning identity, fixed at creation.
    pub owner_id: UserId,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// A message inside a conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Backend id, or a local placeholder while pending.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Creation time (local for pending messages).
    pub created_at: DateTime<Utc>,
    /// Local lifecycle flag; never persisted.
    #[serde(skip, default)]
    pub client_state: ClientState,
}

impl Message {
    /// Build a local placeholder awaiting backend confirmation.
    #[must_use]
    pub fn pending(
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content: content.into(),
            attachment,
            created_at: Utc::now(),
            client_state: ClientState::Pending,
        }
    }

    /// Whether the backend acknowledged this message.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self.client_state, ClientState::Confirmed)
    }

    /// Whether the create request for this message failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.client_state, ClientState::Failed { .. })
    }

    /// Request payload for persisting this message.
    #[must_use]
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            conversation_id: self.conversation_id,
            role: self.role,
            content: self.content.clone(),
            attachment: self.attachment.clone(),
        }
    }
}

/// Create-message request payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
}

/// Profile record; only its existence matters to the core.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Identity the profile belongs to.
    pub id: UserId,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional full name.
    pub full_name: Option<String>,
    /// Optional avatar URL.
    pub avatar_url: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Empty profile for an identity.
    #[must_use]
    pub fn empty(id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            username: None,
            full_name: None,
            avatar_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Blob upload request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobUpload {
    /// Identity uploading the blob; used to namespace storage paths.
    pub owner: UserId,
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Kind hint.
    pub kind: AttachmentKind,
    /// MIME type sent to the store.
    pub content_type: String,
    /// Original or display file name.
    pub file_name: String,
}

impl BlobUpload {
    /// Extension of `file_name`, falling back to `bin`.
    #[must_use]
    pub fn extension(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin")
    }
}
