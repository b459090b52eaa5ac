//! Context retrieval and prompt assembly.
//!
//! Stateless given an embedder, an index and a collection: embed the query,
//! take top-k, and fold the hits into the agent's system prompt. The
//! catalog heading is load-bearing: the model's product-question policy
//! keys off the exact text, so it is emitted verbatim whenever context is
//! present.

use std::collections::HashMap;
use std::sync::Arc;

use voice_broker_core::{ChatMessage, Role};

use crate::embeddings::Embedder;
use crate::vector_store::{PayloadFilter, VectorIndex};
use crate::RagError;

/// Heading injected above retrieved product context. Verbatim by contract.
pub const PRODUCT_CATALOG_HEADING: &str =
    "## Product Catalog (use this to answer product questions):";

const PRODUCT_CATALOG_GUIDANCE: &str = "The following products match the customer's query. Use this information to recommend products, compare options, and answer questions about prices and specifications. Do NOT call the product_stock tool unless customer specifically asks about stock availability.";

/// One retrieved context.
#[derive(Debug, Clone)]
pub struct ContextHit {
    pub text: String,
    pub score: f32,
    pub payload: HashMap<String, String>,
}

/// Retriever configuration.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub collection: String,
    pub top_k: usize,
    /// Optional namespace filter applied to every search.
    pub namespace: Option<String>,
}

impl RetrieverConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            top_k: 5,
            namespace: None,
        }
    }
}

/// Top-k context retriever.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Make sure the collection exists with the embedder's dimension.
    pub async fn ensure_ready(&self) -> Result<(), RagError> {
        self.index
            .ensure_collection(&self.config.collection, self.embedder.dim())
            .await
    }

    /// Retrieve top-k contexts for a query, ordered by decreasing score.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ContextHit>, RagError> {
        let embeddings = self.embedder.embed(&[query.to_string()]).await?;
        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding("embedder returned no vector".into()))?;

        let filter = self
            .config
            .namespace
            .as_ref()
            .map(|ns| PayloadFilter::new().matches("namespace", ns.clone()));

        let hits = self
            .index
            .search(
                &self.config.collection,
                &vector,
                self.config.top_k,
                filter.as_ref(),
            )
            .await?;

        Ok(hits
            .into_iter()
            .map(|h| {
                let text = h.payload.get("text").cloned().unwrap_or_default();
                ContextHit {
                    text,
                    score: h.score,
                    payload: h.payload,
                }
            })
            .collect())
    }
}

/// Build the retrieval query from conversation history: the last
/// up-to-three user messages, oldest first, joined by single spaces.
pub fn build_rag_query(messages: &[ChatMessage]) -> String {
    let recent: Vec<&str> = messages
        .iter()
        .rev()
        .take(6)
        .filter(|m| m.role == Role::User && !m.text().trim().is_empty())
        .take(3)
        .map(|m| m.text())
        .collect();

    recent
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fold retrieved context into the agent's system prompt. With no context
/// the base prompt passes through untouched.
pub fn compose_system_prompt(base: &str, contexts: &[ContextHit]) -> String {
    if contexts.is_empty() {
        return base.to_string();
    }
    let joined = contexts
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{base}\n\n{PRODUCT_CATALOG_HEADING}\n{PRODUCT_CATALOG_GUIDANCE}\n\n{joined}")
}
