//! Wiring of the configured backend, reply generator and microphone.

use std::sync::Arc;

use tracing::info;

use crate::llm::OllamaReplyGenerator;
use crate::sync::attachment::Microphone;
use crate::sync::backend::{Backend, InMemoryBackend, RestBackend, SqliteBackend};
use crate::sync::core::config::{BackendKind, ReplyMode, SyncConfig};
use crate::sync::core::errors::SyncResult;
use crate::sync::reply::{CannedReply, ReplyGenerator};
use crate::sync::session::SessionBinding;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SyncServices {
    /// Persistence, storage and profile service.
    pub backend: Arc<dyn Backend>,
    /// Assistant reply source.
    pub reply: Arc<dyn ReplyGenerator>,
    /// Capture device for voice attachments.
    pub microphone: Arc<dyn Microphone>,
    /// Configuration the services were built from.
    pub config: SyncConfig,
}

impl SyncServices {
    /// Build the services selected by `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the backend cannot
    /// be opened.
    pub async fn from_config(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let backend: Arc<dyn Backend> = match config.backend.kind {
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
            BackendKind::Sqlite => Arc::new(SqliteBackend::open(&config.backend.sqlite).await?),
            BackendKind::Rest => Arc::new(RestBackend::new(&config.backend.rest)?),
        };
        let reply: Arc<dyn ReplyGenerator> = match config.reply.mode {
            ReplyMode::Canned => Arc::new(CannedReply::new(config.reply.canned_text.clone())),
            ReplyMode::Ollama => Arc::new(OllamaReplyGenerator::new(&config.reply.ollama)?),
        };
        info!(backend = ?config.backend.kind, reply = ?config.reply.mode, "Services ready");

        Ok(Self {
            backend,
            reply,
            microphone: default_microphone(),
            config,
        })
    }

    /// Session binding over these services.
    #[must_use]
    pub fn session(&self) -> SessionBinding {
        SessionBinding::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.reply),
            Arc::clone(&self.microphone),
            self.config.attachments.clone(),
        )
    }
}

#[cfg(feature = "cpal_mic")]
fn default_microphone() -> Arc<dyn Microphone> {
    Arc::new(crate::sync::attachment::CpalMicrophone)
}

#[cfg(not(feature = "cpal_mic"))]
fn default_microphone() -> Arc<dyn Microphone> {
    Arc::new(crate::sync::attachment::NoMicrophone)
}
