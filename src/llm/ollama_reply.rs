//! Assistant replies generated by a local Ollama server.
//!
//! Behaviour:
//! - `GET /api/version` tells whether the server is reachable.
//! - Each reply is one non-streaming `POST /api/chat` carrying the confirmed
//!   history of the conversation.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::sync::core::config::OllamaConfig;
use crate::sync::core::errors::{SyncError, SyncResult};
use crate::sync::core::ids::ConversationId;
use crate::sync::core::model::Message;
use crate::sync::reply::{ReplyFuture, ReplyGenerator};

/// Connection timeout for the Ollama API.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    keep_alive: &'a str,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

/// Reply generator backed by Ollama's chat endpoint.
pub struct OllamaReplyGenerator {
    client: Client,
    base: Url,
    model: String,
    keep_alive: String,
    num_predict: u32,
}

impl OllamaReplyGenerator {
    /// Build a client from config.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &OllamaConfig) -> SyncResult<Self> {
        let mut base = Url::parse(&config.base_url)?;
        // `join` replaces the last segment unless the path ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(IO_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| SyncError::Reply(err.to_string()))?;
        Ok(Self {
            client,
            base,
            model: config.model.clone(),
            keep_alive: config.keep_alive.clone(),
            num_predict: config.num_predict,
        })
    }

    /// Whether the Ollama server answers.
    pub async fn is_ready(&self) -> bool {
        let Ok(url) = self.base.join("api/version") else {
            return false;
        };
        self.client
            .get(url)
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }

    async fn chat(&self, history: &[Message]) -> SyncResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: history
                .iter()
                .filter(|m| !m.content.is_empty())
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: false,
            keep_alive: &self.keep_alive,
            options: ChatOptions {
                num_predict: self.num_predict,
            },
        };

        let url = self.base.join("api/chat")?;
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|err| SyncError::Reply(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Reply(format!("ollama http status not ok: {status}")));
        }

        let body = response
            .json::<ChatResponse>()
            .await
            .map_err(|err| SyncError::Reply(err.to_string()))?;
        body.message
            .map(|m| m.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| SyncError::Reply("ollama returned an empty reply".to_string()))
    }
}

impl ReplyGenerator for OllamaReplyGenerator {
    fn generate_reply<'a>(
        &'a self,
        conversation: ConversationId,
        history: &'a [Message],
    ) -> ReplyFuture<'a, SyncResult<String>> {
        Box::pin(async move {
            debug!(%conversation, turns = history.len(), model = %self.model, "Requesting reply");
            self.chat(history).await
        })
    }
}
