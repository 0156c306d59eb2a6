//! Durable storage for document snapshots.
//!
//! ```text
//! ┌──────────────────┐  save_document(id, bytes)  ┌──────────────────┐
//! │ persistence loop │ ─────────────────────────► │ DocumentStore    │
//! │ (per connection) │                            │ ├─ MemoryStore   │
//! └──────────────────┘                            │ └─ RocksStore    │
//!                                                 └──────────────────┘
//! ```
//!
//! Writes are upserts keyed by document id: the store keeps only the latest
//! snapshot and bumps a per-document version on every write. Concurrent
//! writers for different documents never conflict.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;

use crate::protocol::DocumentId;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No snapshot has been stored under this id
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    /// Backend failure
    #[error("Database error: {0}")]
    Database(String),
    /// Metadata encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Snapshot decompression failed
    #[error("Compression error: {0}")]
    Compression(String),
}

/// The relational-store contract the realtime core depends on.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Durably associate `bytes` with `id`, replacing any previous snapshot.
    async fn save_document(&self, id: &DocumentId, bytes: &[u8]) -> Result<(), StoreError>;

    /// Latest stored snapshot for `id`.
    async fn load_document(&self, id: &DocumentId) -> Result<Vec<u8>, StoreError>;

    /// Number of writes applied to `id` so far (0 if never written).
    async fn document_version(&self, id: &DocumentId) -> Result<u64, StoreError>;
}
