//! Product rows and the sync store contract.
//!
//! The relational store itself is an external collaborator; the pipeline
//! only sees this trait. `MemorySyncStore` is the in-process
//! implementation used by tests and single-node deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use voice_broker_tools::SourceProduct;

use crate::SyncError;

/// One durable product row.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub id: Uuid,
    pub agent_tool_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub price: Option<String>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub in_stock: bool,
    pub extra_data: Value,
    pub content_hash: String,
    pub rag_indexed: bool,
    pub rag_indexed_at: Option<DateTime<Utc>>,
    pub qdrant_point_id: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProductRow {
    /// The text that gets embedded. Stable and deterministic; the content
    /// hash is a digest over the inputs of this rendering.
    pub fn to_rag_text(&self) -> String {
        let mut lines = vec![format!("Product: {}", self.name)];
        let description = self
            .description
            .as_deref()
            .or(self.long_description.as_deref());
        if let Some(description) = description {
            lines.push(format!("Description: {description}"));
        }
        if let Some(ref price) = self.price {
            match self.currency {
                Some(ref currency) => lines.push(format!("Price: {price} {currency}")),
                None => lines.push(format!("Price: {price}")),
            }
        }
        if let Some(ref category) = self.category {
            lines.push(format!("Category: {category}"));
        }
        lines.push(format!(
            "Availability: {}",
            if self.in_stock { "In stock" } else { "Out of stock" }
        ));
        lines.join("\n")
    }
}

/// A pending insert-or-update produced by stage A.
#[derive(Debug, Clone)]
pub struct ProductUpsert {
    pub product: SourceProduct,
    pub content_hash: String,
}

/// Marks applied after a successful vector upsert.
#[derive(Debug, Clone)]
pub struct IndexMark {
    pub row_id: Uuid,
    pub point_id: String,
}

/// Per-binding sync marker persisted between runs.
#[derive(Debug, Clone, Default)]
pub struct SyncMarker {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_count: usize,
}

/// Aggregate index statistics for a binding.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_products: usize,
    pub indexed_products: usize,
    pub pending_indexing: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Store contract consumed by the pipeline. Batch application is atomic
/// per call; partial progress across calls is durable by design.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn products_for_binding(&self, binding_id: Uuid) -> Result<Vec<ProductRow>, SyncError>;

    /// Insert new rows and update changed ones; both land with
    /// `rag_indexed = false`.
    async fn apply_batch(
        &self,
        binding_id: Uuid,
        upserts: Vec<ProductUpsert>,
    ) -> Result<(), SyncError>;

    /// Delete rows whose external id is not in `seen`. Full syncs only.
    async fn delete_absent(
        &self,
        binding_id: Uuid,
        seen: &HashSet<String>,
    ) -> Result<usize, SyncError>;

    /// Rows flagged for (re-)embedding, up to `limit`.
    async fn pending_index(
        &self,
        binding_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProductRow>, SyncError>;

    async fn mark_indexed(
        &self,
        binding_id: Uuid,
        marks: Vec<IndexMark>,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    /// Point ids of rows that still exist and have been indexed.
    async fn indexed_point_ids(&self, binding_id: Uuid) -> Result<HashSet<String>, SyncError>;

    async fn load_marker(&self, binding_id: Uuid) -> Result<SyncMarker, SyncError>;

    async fn save_marker(&self, binding_id: Uuid, marker: SyncMarker) -> Result<(), SyncError>;

    async fn stats(&self, binding_id: Uuid) -> Result<IndexStats, SyncError>;
}

/// In-memory store keyed by binding id.
#[derive(Default)]
pub struct MemorySyncStore {
    rows: Mutex<HashMap<Uuid, Vec<ProductRow>>>,
    markers: Mutex<HashMap<Uuid, SyncMarker>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row access for assertions.
    pub fn row(&self, binding_id: Uuid, external_id: &str) -> Option<ProductRow> {
        self.rows
            .lock()
            .get(&binding_id)
            .and_then(|rows| rows.iter().find(|r| r.external_id == external_id).cloned())
    }
}

fn row_from(binding_id: Uuid, upsert: &ProductUpsert, now: DateTime<Utc>) -> ProductRow {
    let p = &upsert.product;
    ProductRow {
        id: Uuid::new_v4(),
        agent_tool_id: binding_id,
        external_id: p.external_id.clone(),
        name: p.name.clone(),
        description: p.description.clone(),
        long_description: p.long_description.clone(),
        price: p.price.clone(),
        currency: p.currency.clone(),
        category: p.category.clone(),
        sku: p.sku.clone(),
        url: p.url.clone(),
        image_url: p.image_url.clone(),
        in_stock: p.in_stock,
        extra_data: p.extra.clone(),
        content_hash: upsert.content_hash.clone(),
        rag_indexed: false,
        rag_indexed_at: None,
        qdrant_point_id: None,
        source_updated_at: p.source_updated_at,
        updated_at: now,
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn products_for_binding(&self, binding_id: Uuid) -> Result<Vec<ProductRow>, SyncError> {
        Ok(self.rows.lock().get(&binding_id).cloned().unwrap_or_default())
    }

    async fn apply_batch(
        &self,
        binding_id: Uuid,
        upserts: Vec<ProductUpsert>,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let rows = rows.entry(binding_id).or_default();

        for upsert in upserts {
            match rows
                .iter_mut()
                .find(|r| r.external_id == upsert.product.external_id)
            {
                Some(existing) => {
                    let p = &upsert.product;
                    existing.name = p.name.clone();
                    existing.description = p.description.clone();
                    existing.long_description = p.long_description.clone();
                    existing.price = p.price.clone();
                    existing.currency = p.currency.clone();
                    existing.category = p.category.clone();
                    existing.sku = p.sku.clone();
                    existing.url = p.url.clone();
                    existing.image_url = p.image_url.clone();
                    existing.in_stock = p.in_stock;
                    existing.extra_data = p.extra.clone();
                    existing.content_hash = upsert.content_hash.clone();
                    existing.rag_indexed = false;
                    existing.source_updated_at = p.source_updated_at;
                    existing.updated_at = now;
                }
                None => rows.push(row_from(binding_id, &upsert, now)),
            }
        }
        Ok(())
    }

    async fn delete_absent(
        &self,
        binding_id: Uuid,
        seen: &HashSet<String>,
    ) -> Result<usize, SyncError> {
        let mut rows = self.rows.lock();
        let Some(rows) = rows.get_mut(&binding_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| seen.contains(&r.external_id));
        Ok(before - rows.len())
    }

    async fn pending_index(
        &self,
        binding_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProductRow>, SyncError> {
        Ok(self
            .rows
            .lock()
            .get(&binding_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| !r.rag_indexed)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_indexed(
        &self,
        binding_id: Uuid,
        marks: Vec<IndexMark>,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut rows = self.rows.lock();
        let Some(rows) = rows.get_mut(&binding_id) else {
            return Ok(());
        };
        for mark in marks {
            if let Some(row) = rows.iter_mut().find(|r| r.id == mark.row_id) {
                row.rag_indexed = true;
                row.rag_indexed_at = Some(at);
                row.qdrant_point_id = Some(mark.point_id);
            }
        }
        Ok(())
    }

    async fn indexed_point_ids(&self, binding_id: Uuid) -> Result<HashSet<String>, SyncError> {
        Ok(self
            .rows
            .lock()
            .get(&binding_id)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.qdrant_point_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_marker(&self, binding_id: Uuid) -> Result<SyncMarker, SyncError> {
        Ok(self
            .markers
            .lock()
            .get(&binding_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_marker(&self, binding_id: Uuid, marker: SyncMarker) -> Result<(), SyncError> {
        self.markers.lock().insert(binding_id, marker);
        Ok(())
    }

    async fn stats(&self, binding_id: Uuid) -> Result<IndexStats, SyncError> {
        let rows = self.rows.lock();
        let rows = rows.get(&binding_id).map(Vec::as_slice).unwrap_or(&[]);
        let total = rows.len();
        let indexed = rows.iter().filter(|r| r.rag_indexed).count();
        Ok(IndexStats {
            total_products: total,
            indexed_products: indexed,
            pending_indexing: total - indexed,
            last_indexed_at: rows.iter().filter_map(|r| r.rag_indexed_at).max(),
        })
    }
}
