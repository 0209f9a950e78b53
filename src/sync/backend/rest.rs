//! HTTP backend for a PostgREST-style table API with object storage.
//!
//! Tables live under `/rest/v1/{table}` and are filtered with `eq.` operators;
//! blobs live under `/storage/v1/object/{bucket}/{path}` and are served from
//! `/storage/v1/object/public/{bucket}/{path}`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Backend, BackendFuture};
use crate::sync::core::config::RestConfig;
use crate::sync::core::errors::{BackendError, BackendResult};
use crate::sync::core::ids::{ConversationId, MessageId, UserId};
use crate::sync::core::model::{
    Attachment, AttachmentKind, BlobUpload, ClientState, Conversation, Message, NewMessage,
    Profile, Role,
};

const PROFILES: &str = "profiles";
const CHATS: &str = "chats";
const MESSAGES: &str = "messages";

/// Connection timeout for the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ProfileRow {
    id: UserId,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            full_name: row.full_name,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct ChatRow {
    id: ConversationId,
    user_id: UserId,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ChatRow> for Conversation {
    fn from(row: ChatRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.user_id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct MessageRow {
    id: MessageId,
    chat_id: ConversationId,
    role: Role,
    content: String,
    #[serde(default)]
    attachment_url: Option<String>,
    #[serde(default)]
    attachment_type: Option<AttachmentKind>,
    #[serde(default)]
    attachment_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let attachment = match (row.attachment_url, row.attachment_type) {
            (Some(url), Some(kind)) => Some(Attachment {
                url,
                kind,
                name: row.attachment_name.unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            id: row.id,
            conversation_id: row.chat_id,
            role: row.role,
            content: row.content,
            attachment,
            created_at: row.created_at,
            client_state: ClientState::Confirmed,
        }
    }
}

#[derive(Serialize)]
struct InsertProfile {
    id: UserId,
}

#[derive(Serialize)]
struct InsertChat<'a> {
    user_id: UserId,
    title: &'a str,
}

#[derive(Serialize)]
struct UpdateChat<'a> {
    title: &'a str,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct InsertMessage<'a> {
    chat_id: ConversationId,
    content: &'a str,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_type: Option<AttachmentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_name: Option<&'a str>,
}

/// HTTP implementation of the backend contract.
pub struct RestBackend {
    client: Client,
    base: Url,
    api_key: String,
    bearer: String,
    bucket: String,
}

impl RestBackend {
    /// Build a client from config.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &RestConfig) -> BackendResult<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|err| BackendError::Malformed(format!("invalid base url: {err}")))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base,
            api_key: config.api_key.clone(),
            bearer: config
                .access_token
                .clone()
                .unwrap_or_else(|| config.api_key.clone()),
            bucket: config.bucket.clone(),
        })
    }

    fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> BackendResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                BackendError::Malformed(format!("base url cannot be a base: {}", self.base))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn table(&self, table: &str, query: &[(&str, String)]) -> BackendResult<Url> {
        let mut url = self.endpoint(["rest", "v1", table])?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.bearer))
    }

    fn returning(&self, method: Method, url: Url) -> RequestBuilder {
        self.request(method, url)
            .header("Prefer", "return=representation")
    }

    async fn execute(builder: RequestBuilder) -> BackendResult<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(BackendError::Conflict(body));
        }
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(builder: RequestBuilder) -> BackendResult<T> {
        Ok(Self::execute(builder).await?.json::<T>().await?)
    }

    async fn fetch_one<T: DeserializeOwned>(builder: RequestBuilder, what: &str) -> BackendResult<T> {
        Self::fetch::<Vec<T>>(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Missing(what.to_string()))
    }

    /// Storage path of an upload: `{folder}/{owner}/{millis}.{ext}`.
    fn object_path(upload: &BlobUpload) -> String {
        let folder = match upload.kind {
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "uploads",
        };
        format!(
            "{folder}/{}/{}.{}",
            upload.owner,
            Utc::now().timestamp_millis(),
            upload.extension()
        )
    }
}

impl Backend for RestBackend {
    fn get_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Option<Profile>>> {
        Box::pin(async move {
            let url = self.table(
                PROFILES,
                &[("id", format!("eq.{id}")), ("select", "*".to_string())],
            )?;
            let rows: Vec<ProfileRow> = Self::fetch(self.request(Method::GET, url)).await?;
            Ok(rows.into_iter().next().map(Profile::from))
        })
    }

    fn create_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Profile>> {
        Box::pin(async move {
            let url = self.table(PROFILES, &[])?;
            let builder = self
                .returning(Method::POST, url)
                .json(&InsertProfile { id });
            let row: ProfileRow = Self::fetch_one(builder, "created profile").await?;
            Ok(row.into())
        })
    }

    fn list_conversations(
        &self,
        owner: UserId,
    ) -> BackendFuture<'_, BackendResult<Vec<Conversation>>> {
        Box::pin(async move {
            let url = self.table(
                CHATS,
                &[
                    ("user_id", format!("eq.{owner}")),
                    ("select", "*".to_string()),
                    ("order", "created_at.desc".to_string()),
                ],
            )?;
            let rows: Vec<ChatRow> = Self::fetch(self.request(Method::GET, url)).await?;
            Ok(rows.into_iter().map(Conversation::from).collect())
        })
    }

    fn create_conversation(
        &self,
        owner: UserId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        let title = title.to_string();
        Box::pin(async move {
            let url = self.table(CHATS, &[])?;
            let builder = self.returning(Method::POST, url).json(&InsertChat {
                user_id: owner,
                title: &title,
            });
            let row: ChatRow = Self::fetch_one(builder, "created conversation").await?;
            Ok(row.into())
        })
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        let title = title.to_string();
        Box::pin(async move {
            let url = self.table(CHATS, &[("id", format!("eq.{id}"))])?;
            let builder = self.returning(Method::PATCH, url).json(&UpdateChat {
                title: &title,
                updated_at: Utc::now(),
            });
            let row: ChatRow = Self::fetch_one(builder, &format!("conversation {id}")).await?;
            Ok(row.into())
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> BackendFuture<'_, BackendResult<()>> {
        Box::pin(async move {
            let url = self.table(CHATS, &[("id", format!("eq.{id}"))])?;
            Self::execute(self.request(Method::DELETE, url)).await?;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation: ConversationId,
    ) -> BackendFuture<'_, BackendResult<Vec<Message>>> {
        Box::pin(async move {
            let url = self.table(
                MESSAGES,
                &[
                    ("chat_id", format!("eq.{conversation}")),
                    ("select", "*".to_string()),
                    ("order", "created_at.asc".to_string()),
                ],
            )?;
            let rows: Vec<MessageRow> = Self::fetch(self.request(Method::GET, url)).await?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn create_message(&self, message: NewMessage) -> BackendFuture<'_, BackendResult<Message>> {
        Box::pin(async move {
            let url = self.table(MESSAGES, &[])?;
            let attachment = message.attachment.as_ref();
            let body = InsertMessage {
                chat_id: message.conversation_id,
                content: &message.content,
                role: message.role,
                attachment_url: attachment.map(|a| a.url.as_str()),
                attachment_type: attachment.map(|a| a.kind),
                attachment_name: attachment.map(|a| a.name.as_str()),
            };
            let builder = self.returning(Method::POST, url).json(&body);
            let row: MessageRow = Self::fetch_one(builder, "created message").await?;
            Ok(row.into())
        })
    }

    fn upload_blob(&self, upload: BlobUpload) -> BackendFuture<'_, BackendResult<String>> {
        Box::pin(async move {
            let path = Self::object_path(&upload);
            let upload_url = self.endpoint(
                ["storage", "v1", "object", self.bucket.as_str()]
                    .into_iter()
                    .chain(path.split('/')),
            )?;
            let builder = self
                .request(Method::POST, upload_url)
                .header(CONTENT_TYPE, upload.content_type.as_str())
                .body(upload.bytes);
            Self::execute(builder).await?;

            let public_url = self.endpoint(
                ["storage", "v1", "object", "public", self.bucket.as_str()]
                    .into_iter()
                    .chain(path.split('/')),
            )?;
            Ok(public_url.to_string())
        })
    }
}
