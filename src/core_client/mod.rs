//! Core-service client: the write side of the workspace.
//!
//! Tools never talk HTTP directly; they hold an `Arc<dyn CoreService>`
//! constructed once at startup and injected. This module handles:
//! - Create / update / get / delete for documents, tasks and boards
//! - Bulk task creation
//! - Idempotency keys so transport retries do not duplicate mutations
//! - Mapping HTTP status + body into [`CoreServiceError`]

pub mod client;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{CoreService, HttpCoreService, InMemoryCoreService, RecordedCall};
pub use errors::CoreServiceError;
pub use types::EntityKind;
