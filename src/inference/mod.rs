//! Inference client: OpenAI-compatible API client for the planning model.
//!
//! The engine only needs `infer(prompt) -> text`. Everything that uses a
//! model (intent classification, synthesis) also has a rule-based path, so
//! the model is optional and swappable via config.

pub mod client;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{InferenceClient, LanguageModel};
pub use errors::InferenceError;
pub use types::{ChatMessage, Role};
