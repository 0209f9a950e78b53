//! Language-model reply generators.

pub mod ollama_reply;

pub use ollama_reply::OllamaReplyGenerator;
