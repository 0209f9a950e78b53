//! Configuration for the synchronization core.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::sync::core::errors::{SyncError, SyncResult};

/// Prefix shared by every environment variable read by [`SyncConfig::from_env`].
pub const ENV_PREFIX: &str = "PARLEY_";

/// Text of the default canned assistant reply.
pub const DEFAULT_CANNED_REPLY: &str = "Thanks for your message! This is a placeholder reply.";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend selection and adapter settings.
    pub backend: BackendConfig,
    /// Assistant reply settings.
    pub reply: ReplyConfig,
    /// Attachment pipeline settings.
    pub attachments: AttachmentConfig,
}

impl SyncConfig {
    /// Build a configuration from `PARLEY_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Keys are the environment variable names, e.g. `PARLEY_BACKEND`.
    ///
    /// # Errors
    /// Returns an error if a value cannot be parsed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(kind) = get("BACKEND") {
            config.backend.kind = kind.parse()?;
        }
        if let Some(path) = get("SQLITE_PATH") {
            config.backend.sqlite.path = PathBuf::from(path);
        }
        if let Some(dir) = get("BLOB_DIR") {
            config.backend.sqlite.blob_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("REST_URL") {
            config.backend.rest.base_url = url;
        }
        if let Some(key) = get("REST_API_KEY") {
            config.backend.rest.api_key = key;
        }
        config.backend.rest.access_token = get("REST_ACCESS_TOKEN");
        if let Some(bucket) = get("REST_BUCKET") {
            config.backend.rest.bucket = bucket;
        }
        if let Some(secs) = get("REST_TIMEOUT_SECS") {
            config.backend.rest.timeout_secs = parse_number("REST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(mode) = get("REPLY") {
            config.reply.mode = mode.parse()?;
        }
        if let Some(text) = get("CANNED_REPLY") {
            config.reply.canned_text = text;
        }
        if let Some(url) = get("OLLAMA_URL") {
            config.reply.ollama.base_url = url;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            config.reply.ollama.model = model;
        }
        if let Some(keep_alive) = get("OLLAMA_KEEP_ALIVE") {
            config.reply.ollama.keep_alive = keep_alive;
        }
        if let Some(tokens) = get("OLLAMA_NUM_PREDICT") {
            config.reply.ollama.num_predict = parse_number("OLLAMA_NUM_PREDICT", &tokens)?;
        }
        if let Some(secs) = get("OLLAMA_TIMEOUT_SECS") {
            config.reply.ollama.timeout_secs = parse_number("OLLAMA_TIMEOUT_SECS", &secs)?;
        }
        if let Some(max) = get("MAX_UPLOAD_BYTES") {
            config.attachments.max_upload_bytes = parse_number("MAX_UPLOAD_BYTES", &max)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> SyncResult<()> {
        if self.backend.kind == BackendKind::Rest {
            Url::parse(&self.backend.rest.base_url)?;
            if self.backend.rest.api_key.trim().is_empty() {
                return Err(SyncError::InvalidConfig(
                    "backend.rest.api_key must be set for the rest backend".to_string(),
                ));
            }
            if self.backend.rest.bucket.trim().is_empty() {
                return Err(SyncError::InvalidConfig(
                    "backend.rest.bucket must not be empty".to_string(),
                ));
            }
        }

        if self.backend.rest.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "backend.rest.timeout_secs must be > 0".to_string(),
            ));
        }

        match self.reply.mode {
            ReplyMode::Canned => {
                if self.reply.canned_text.trim().is_empty() {
                    return Err(SyncError::InvalidConfig(
                        "reply.canned_text must not be empty".to_string(),
                    ));
                }
            }
            ReplyMode::Ollama => {
                Url::parse(&self.reply.ollama.base_url)?;
                if self.reply.ollama.model.trim().is_empty() {
                    return Err(SyncError::InvalidConfig(
                        "reply.ollama.model must not be empty".to_string(),
                    ));
                }
            }
        }

        if self.reply.ollama.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "reply.ollama.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.attachments.max_upload_bytes == 0 {
            return Err(SyncError::InvalidConfig(
                "attachments.max_upload_bytes must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> SyncResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::InvalidConfig(format!("{ENV_PREFIX}{name} is not a number: {raw}")))
}

/// Backend adapter selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process maps; nothing survives the process.
    Memory,
    /// Local `SQLite` database plus a blob directory.
    #[default]
    Sqlite,
    /// PostgREST-style table API plus object storage over HTTP.
    Rest,
}

impl FromStr for BackendKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "rest" => Ok(Self::Rest),
            other => Err(SyncError::InvalidConfig(format!(
                "unknown backend kind: {other}"
            ))),
        }
    }
}

/// Backend settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Which adapter to build.
    pub kind: BackendKind,
    /// `SQLite` adapter settings.
    pub sqlite: SqliteConfig,
    /// HTTP adapter settings.
    pub rest: RestConfig,
}

/// `SQLite` adapter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database path.
    pub path: PathBuf,
    /// Directory receiving uploaded blobs.
    pub blob_dir: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("parley.sqlite"),
            blob_dir: PathBuf::from("parley-blobs"),
        }
    }
}

/// HTTP adapter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestConfig {
    /// Service root, e.g. `https://project.example.co`.
    pub base_url: String,
    /// Public API key sent as `apikey`.
    pub api_key: String,
    /// Session token sent as bearer; falls back to the API key.
    pub access_token: Option<String>,
    /// Storage bucket for attachments.
    pub bucket: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            api_key: String::new(),
            access_token: None,
            bucket: "chat-attachments".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Reply generator selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Fixed text.
    #[default]
    Canned,
    /// Local Ollama chat endpoint.
    Ollama,
}

impl FromStr for ReplyMode {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "canned" => Ok(Self::Canned),
            "ollama" => Ok(Self::Ollama),
            other => Err(SyncError::InvalidConfig(format!("unknown reply mode: {other}"))),
        }
    }
}

/// Assistant reply settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Which generator to build.
    pub mode: ReplyMode,
    /// Text used by the canned generator.
    pub canned_text: String,
    /// Ollama settings.
    pub ollama: OllamaConfig,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            mode: ReplyMode::Canned,
            canned_text: DEFAULT_CANNED_REPLY.to_string(),
            ollama: OllamaConfig::default(),
        }
    }
}

/// Ollama chat settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama base URL.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// How long Ollama keeps the model loaded.
    pub keep_alive: String,
    /// Token budget per reply.
    pub num_predict: u32,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "ministral-3:8b-instruct-2512-q8_0".to_string(),
            keep_alive: "5m".to_string(),
            num_predict: 512,
            timeout_secs: 120,
        }
    }
}

/// Attachment pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: usize,
    /// Display name given to voice recordings.
    pub audio_display_name: String,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024, // 10 MB
            audio_display_name: "Voice recording".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PARLEY_BACKEND", "rest"),
            ("PARLEY_REST_URL", "https://db.example.co"),
            ("PARLEY_REST_API_KEY", "anon"),
            ("PARLEY_MAX_UPLOAD_BYTES", "2048"),
        ]))
        .unwrap();

        assert_eq!(config.backend.kind, BackendKind::Rest);
        assert_eq!(config.backend.rest.base_url, "https://db.example.co");
        assert_eq!(config.attachments.max_upload_bytes, 2048);
        assert_eq!(config.reply.mode, ReplyMode::Canned);
    }

    #[test]
    fn test_lookup_reads_ollama_options() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PARLEY_REPLY", "ollama"),
            ("PARLEY_OLLAMA_KEEP_ALIVE", "30m"),
            ("PARLEY_OLLAMA_NUM_PREDICT", "64"),
            ("PARLEY_OLLAMA_TIMEOUT_SECS", "9"),
        ]))
        .unwrap();

        assert_eq!(config.reply.ollama.keep_alive, "30m");
        assert_eq!(config.reply.ollama.num_predict, 64);
        assert_eq!(config.reply.ollama.timeout_secs, 9);
        assert!(SyncConfig::from_lookup(lookup(&[("PARLEY_OLLAMA_TIMEOUT_SECS", "0")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("PARLEY_OLLAMA_NUM_PREDICT", "-1")])).is_err());
    }

    #[test]
    fn test_rest_backend_requires_api_key() {
        let result = SyncConfig::from_lookup(lookup(&[("PARLEY_BACKEND", "rest")]));
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SyncConfig::from_lookup(lookup(&[("PARLEY_BACKEND", "postgres")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("PARLEY_MAX_UPLOAD_BYTES", "lots")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("PARLEY_MAX_UPLOAD_BYTES", "0")])).is_err());
        assert!(
            SyncConfig::from_lookup(lookup(&[
                ("PARLEY_REPLY", "ollama"),
                ("PARLEY_OLLAMA_URL", "not a url"),
            ]))
            .is_err()
        );
    }
}
