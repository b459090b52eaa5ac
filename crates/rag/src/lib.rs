//! Retrieval-augmented generation support.
//!
//! Embedders turn text into unit-normalized vectors, the vector index
//! abstracts the store behind the broker's contract (Qdrant in production,
//! in-memory in tests), and the retriever assembles top-k context into the
//! system prompt.

pub mod embeddings;
pub mod retriever;
pub mod vector_store;

use thiserror::Error;

/// RAG errors.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("collection {collection} has dimension {actual}, embedder produces {expected}")]
    DimensionMismatch {
        collection: String,
        actual: usize,
        expected: usize,
    },
}

pub use embeddings::{Embedder, HashEmbedder, OllamaEmbedder, OpenAiEmbedder};
pub use retriever::{
    build_rag_query, compose_system_prompt, ContextHit, Retriever, RetrieverConfig,
    PRODUCT_CATALOG_HEADING,
};
pub use vector_store::{
    MemoryIndex, PayloadFilter, QdrantIndex, ScrolledPoint, SearchHit, VectorIndex, VectorPoint,
};
