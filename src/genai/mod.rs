//! # Generative AI Proxy
//!
//! Server-side wrappers for the hosted model API and an optional local
//! Ollama backend. Keys stay on the server; browsers only see results.
//!
//! ## Modules:
//! - **client**: `generateContent` operations (policy, personas, images, video, speech)
//! - **ollama**: model listing and completions against a local server
//! - **types**: REST shapes and typed results
//! - **error**: backend failure classification

pub mod client;
pub mod error;
pub mod ollama;
pub mod types;

pub use client::GeminiClient;
pub use error::GenAiError;
pub use ollama::{OllamaClient, OllamaOptions};
