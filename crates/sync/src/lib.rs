//! Product-catalog sync pipeline.
//!
//! Two durable stages plus a cleanup pass keep a product vector index
//! incrementally fresh: stage A pulls the source catalog and diffs it into
//! the relational store via content hashes, stage B embeds rows flagged for
//! re-indexing into the vector store, and stage C prunes orphaned points
//! after a full sync that deleted rows.

pub mod hash;
pub mod pipeline;
pub mod store;

use thiserror::Error;

use voice_broker_rag::RagError;
use voice_broker_tools::ToolError;

/// Sync errors. Stage A failures abort the run; stage B failures are
/// per-batch; stage C failures are logged and non-fatal.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("rag sync not enabled for this binding")]
    NotEnabled,

    #[error("integration does not support bulk catalog fetch")]
    NoCatalog,

    #[error("source fetch failed: {0}")]
    Source(#[from] ToolError),

    #[error("store error: {0}")]
    Store(String),

    #[error("vector index error: {0}")]
    Index(#[from] RagError),
}

pub use hash::{content_hash, HASH_SCHEMA_VERSION};
pub use pipeline::{
    ProductSyncService, StageAReport, StageBReport, StageCReport, SyncConfig, SyncOutcome,
    SyncReport, SyncSettings, SyncStatus,
};
pub use store::{
    IndexMark, IndexStats, MemorySyncStore, ProductRow, ProductUpsert, SyncMarker, SyncStore,
};
