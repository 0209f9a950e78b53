//! `SQLite`-backed backend with blobs stored on the local filesystem.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use url::Url;

use super::{Backend, BackendFuture};
use crate::sync::core::config::SqliteConfig;
use crate::sync::core::errors::{BackendError, BackendResult};
use crate::sync::core::ids::{ConversationId, MessageId, UserId};
use crate::sync::core::model::{
    Attachment, AttachmentKind, BlobUpload, ClientState, Conversation, Message, NewMessage,
    Profile, Role,
};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        username TEXT,
        full_name TEXT,
        avatar_url TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_owner_created
        ON conversations (owner_id, created_at DESC);
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        attachment_url TEXT,
        attachment_type TEXT,
        attachment_name TEXT,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
        ON messages (conversation_id, created_at);
";

const CONVERSATION_COLUMNS: &str = "id, owner_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, attachment_url, \
                               attachment_type, attachment_name, created_at";

/// `SQLite` implementation of the backend contract.
pub struct SqliteBackend {
    conn: Connection,
    blob_dir: PathBuf,
}

impl SqliteBackend {
    /// Open (or create) the database and blob directory from config.
    ///
    /// # Errors
    /// Returns an error if the database or the blob directory cannot be opened.
    pub async fn open(config: &SqliteConfig) -> BackendResult<Self> {
        let conn = Connection::open(&config.path).await?;
        Self::init(conn, &config.blob_dir).await
    }

    /// Open a private in-memory database; blobs still go to `blob_dir`.
    ///
    /// # Errors
    /// Returns an error if the blob directory cannot be created.
    pub async fn open_in_memory(blob_dir: impl AsRef<Path>) -> BackendResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, blob_dir.as_ref()).await
    }

    async fn init(conn: Connection, blob_dir: &Path) -> BackendResult<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        tokio::fs::create_dir_all(blob_dir).await?;
        let blob_dir = tokio::fs::canonicalize(blob_dir).await?;

        Ok(Self { conn, blob_dir })
    }
}

/// Current time truncated to the stored millisecond precision.
fn now_millis() -> (DateTime<Utc>, i64) {
    let ms = Utc::now().timestamp_millis();
    (DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now), ms)
}

fn millis_to_datetime(ms: i64) -> BackendResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BackendError::Malformed(format!("invalid timestamp: {ms}")))
}

struct ProfileRow {
    id: UserId,
    username: Option<String>,
    full_name: Option<String>,
    avatar_url: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ProfileRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            avatar_url: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_record(self) -> BackendResult<Profile> {
        Ok(Profile {
            id: self.id,
            username: self.username,
            full_name: self.full_name,
            avatar_url: self.avatar_url,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
        })
    }
}

struct ConversationRow {
    id: ConversationId,
    owner_id: UserId,
    title: String,
    created_at: i64,
    updated_at: i64,
}

impl ConversationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_record(self) -> BackendResult<Conversation> {
        Ok(Conversation {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: MessageId,
    conversation_id: ConversationId,
    role: String,
    content: String,
    attachment_url: Option<String>,
    attachment_type: Option<String>,
    attachment_name: Option<String>,
    created_at: i64,
}

impl MessageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            attachment_url: row.get(4)?,
            attachment_type: row.get(5)?,
            attachment_name: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_record(self) -> BackendResult<Message> {
        let role = Role::from_str(&self.role)
            .map_err(|err| BackendError::Malformed(format!("invalid role: {err}")))?;
        let attachment = match (self.attachment_url, self.attachment_type) {
            (Some(url), Some(kind)) => Some(Attachment {
                url,
                kind: AttachmentKind::from_str(&kind).map_err(|err| {
                    BackendError::Malformed(format!("invalid attachment type: {err}"))
                })?,
                name: self.attachment_name.unwrap_or_default(),
            }),
            _ => None,
        };
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            attachment,
            created_at: millis_to_datetime(self.created_at)?,
            client_state: ClientState::Confirmed,
        })
    }
}

impl Backend for SqliteBackend {
    fn get_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Option<Profile>>> {
        Box::pin(async move {
            let row = self
                .conn
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            "SELECT id, username, full_name, avatar_url, created_at, updated_at
                             FROM profiles WHERE id = ?1",
                            rusqlite::params![id],
                            ProfileRow::read,
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            row.map(ProfileRow::into_record).transpose()
        })
    }

    fn create_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Profile>> {
        Box::pin(async move {
            let (now, now_ms) = now_millis();
            let profile = Profile::empty(id, now);
            let inserted = self
                .conn
                .call(move |conn| {
                    let inserted = conn.execute(
                        "INSERT OR IGNORE INTO profiles (id, created_at, updated_at)
                         VALUES (?1, ?2, ?3)",
                        rusqlite::params![id, now_ms, now_ms],
                    )?;
                    Ok(inserted)
                })
                .await?;
            if inserted == 0 {
                return Err(BackendError::Conflict(format!("profile {id} already exists")));
            }
            Ok(profile)
        })
    }

    fn list_conversations(
        &self,
        owner: UserId,
    ) -> BackendFuture<'_, BackendResult<Vec<Conversation>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CONVERSATION_COLUMNS}
                         FROM conversations
                         WHERE owner_id = ?1
                         ORDER BY created_at DESC, rowid DESC"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![owner], ConversationRow::read)?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(ConversationRow::into_record).collect()
        })
    }

    fn create_conversation(
        &self,
        owner: UserId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        let title = title.to_string();
        Box::pin(async move {
            let (now, now_ms) = now_millis();
            let record = Conversation {
                id: ConversationId::new(),
                owner_id: owner,
                title,
                created_at: now,
                updated_at: now,
            };
            let id = record.id;
            let title = record.title.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO conversations (id, owner_id, title, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![id, owner, title, now_ms, now_ms],
                    )?;
                    Ok(())
                })
                .await?;
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
            let now_ms = Utc::now().timestamp_millis();
            let row = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![title, now_ms, id],
                    )?;
                    if changed == 0 {
                        return Ok(None);
                    }
                    let row = conn.query_row(
                        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                        rusqlite::params![id],
                        ConversationRow::read,
                    )?;
                    Ok(Some(row))
                })
                .await?;
            row.ok_or_else(|| BackendError::Missing(format!("conversation {id}")))?
                .into_record()
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> BackendFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "DELETE FROM conversations WHERE id = ?1",
                        rusqlite::params![id],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation: ConversationId,
    ) -> BackendFuture<'_, BackendResult<Vec<Message>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS}
                         FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY created_at ASC, rowid ASC"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![conversation], MessageRow::read)?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(MessageRow::into_record).collect()
        })
    }

    fn create_message(&self, message: NewMessage) -> BackendFuture<'_, BackendResult<Message>> {
        Box::pin(async move {
            let record = Message {
                id: MessageId::new(),
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                attachment: message.attachment,
                created_at: now_millis().0,
                client_state: ClientState::Confirmed,
            };
            let row = record.clone();
            let exists = self
                .conn
                .call(move |conn| {
                    let exists: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                        rusqlite::params![row.conversation_id],
                        |r| r.get(0),
                    )?;
                    if exists == 0 {
                        return Ok(false);
                    }
                    let (url, kind, name) = match row.attachment {
                        Some(a) => (Some(a.url), Some(a.kind.as_str()), Some(a.name)),
                        None => (None, None, None),
                    };
                    conn.execute(
                        &format!(
                            "INSERT INTO messages ({MESSAGE_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                        ),
                        rusqlite::params![
                            row.id,
                            row.conversation_id,
                            row.role.as_str(),
                            row.content,
                            url,
                            kind,
                            name,
                            row.created_at.timestamp_millis()
                        ],
                    )?;
                    Ok(true)
                })
                .await?;
            if !exists {
                return Err(BackendError::Missing(format!(
                    "conversation {}",
                    record.conversation_id
                )));
            }
            Ok(record)
        })
    }

    fn upload_blob(&self, upload: BlobUpload) -> BackendFuture<'_, BackendResult<String>> {
        Box::pin(async move {
            let dir = self
                .blob_dir
                .join(upload.kind.as_str())
                .join(upload.owner.to_string());
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(format!(
                "{}-{}.{}",
                Utc::now().timestamp_millis(),
                MessageId::new(),
                upload.extension()
            ));
            tokio::fs::write(&path, &upload.bytes).await?;
            let url = Url::from_file_path(&path).map_err(|()| {
                BackendError::Malformed(format!("blob path is not absolute: {}", path.display()))
            })?;
            Ok(url.to_string())
        })
    }
}
