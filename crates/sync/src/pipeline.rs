//! The sync pipeline itself.
//!
//! Stage A: source to relational store (diff by content hash, batch
//! upserts, deletions on full syncs only). Stage B: relational store to
//! vector store (embed pending rows, deterministic point ids, per-batch
//! failure isolation). Stage C: orphan cleanup after a full sync that
//! deleted rows. One sync runs per binding at a time; different bindings
//! sync concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use voice_broker_core::ToolBinding;
use voice_broker_rag::{Embedder, PayloadFilter, VectorIndex, VectorPoint};
use voice_broker_tools::{SourceProduct, ToolIntegration};

use crate::hash::content_hash;
use crate::store::{IndexMark, IndexStats, ProductUpsert, SyncMarker, SyncStore};
use crate::SyncError;

/// Pipeline batch sizes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows per relational upsert transaction.
    pub upsert_batch: usize,
    /// Rows per stage-B indexing pass.
    pub index_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upsert_batch: 100,
            index_batch: 500,
        }
    }
}

/// Per-binding settings read from the binding's integration config.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub use_as_rag: bool,
    pub sync_interval_hours: i64,
}

impl SyncSettings {
    pub fn from_binding(binding: &ToolBinding) -> Self {
        let config = &binding.integration_config;
        Self {
            use_as_rag: config
                .get("use_as_rag")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            sync_interval_hours: config
                .get("sync_interval_hours")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(24),
        }
    }
}

/// Stage A statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageAReport {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub total: usize,
}

/// Stage B statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageBReport {
    pub indexed: usize,
    pub failed: usize,
    pub batches: usize,
}

/// Stage C statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCReport {
    pub deleted_points: usize,
}

/// Result of one full pipeline run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub fetched: usize,
    pub stage_a: StageAReport,
    pub stage_b: StageBReport,
    pub stage_c: Option<StageCReport>,
}

/// Outcome of a sync request.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Skipped { reason: String },
    Completed(SyncReport),
}

/// Current sync state for a binding.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub marker: SyncMarker,
    pub stats: IndexStats,
    pub is_syncing: bool,
}

/// Orchestrates the three stages for any number of bindings.
pub struct ProductSyncService {
    store: Arc<dyn SyncStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: SyncConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ProductSyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, binding_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(binding_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run the full pipeline for one binding.
    pub async fn run_sync(
        &self,
        binding: &ToolBinding,
        integration: &dyn ToolIntegration,
        collection: &str,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let settings = SyncSettings::from_binding(binding);
        if !settings.use_as_rag {
            return Err(SyncError::NotEnabled);
        }

        let marker = self.store.load_marker(binding.id).await?;
        if !force {
            if let Some(last) = marker.last_sync_at {
                let next_due = last + ChronoDuration::hours(settings.sync_interval_hours);
                if Utc::now() < next_due {
                    return Ok(SyncOutcome::Skipped {
                        reason: format!("sync not due until {next_due}"),
                    });
                }
            }
        }

        let lock = self.lock_for(binding.id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::info!(binding = %binding.id, "sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped {
                reason: "sync already in progress".to_string(),
            });
        };

        let catalog = integration.as_catalog().ok_or(SyncError::NoCatalog)?;

        // Incremental runs only pull rows modified since the marker; forced
        // runs always pull everything.
        let modified_after = if force { None } else { marker.last_sync_at };
        let full_sync = modified_after.is_none();

        let products = catalog.fetch_all_products(modified_after).await?;
        let fetched = products.len();
        tracing::info!(binding = %binding.id, fetched, full_sync, "fetched source catalog");

        if products.is_empty() {
            return Ok(SyncOutcome::Completed(SyncReport {
                fetched: 0,
                stage_a: StageAReport::default(),
                stage_b: StageBReport::default(),
                stage_c: None,
            }));
        }

        let stage_a = self.stage_a(binding.id, products, full_sync).await?;

        self.store
            .save_marker(
                binding.id,
                SyncMarker {
                    last_sync_at: Some(Utc::now()),
                    last_sync_count: stage_a.total,
                },
            )
            .await?;

        let stage_b = self
            .stage_b(binding.id, binding.agent_id, collection)
            .await?;

        let stage_c = if full_sync && stage_a.deleted > 0 {
            Some(self.stage_c(binding.id, binding.agent_id, collection).await)
        } else {
            None
        };

        Ok(SyncOutcome::Completed(SyncReport {
            fetched,
            stage_a,
            stage_b,
            stage_c,
        }))
    }

    /// Stage B alone: re-index pending rows without fetching the source.
    /// Useful when a previous run stopped between the stages.
    pub async fn index_only(
        &self,
        binding: &ToolBinding,
        collection: &str,
    ) -> Result<StageBReport, SyncError> {
        let lock = self.lock_for(binding.id);
        let _guard = lock.lock().await;
        self.stage_b(binding.id, binding.agent_id, collection).await
    }

    /// Marker plus index statistics for a binding.
    pub async fn status(&self, binding_id: Uuid) -> Result<SyncStatus, SyncError> {
        let marker = self.store.load_marker(binding_id).await?;
        let stats = self.store.stats(binding_id).await?;
        let is_syncing = self
            .locks
            .get(&binding_id)
            .map(|l| l.try_lock().is_err())
            .unwrap_or(false);
        Ok(SyncStatus {
            marker,
            stats,
            is_syncing,
        })
    }

    async fn stage_a(
        &self,
        binding_id: Uuid,
        products: Vec<SourceProduct>,
        full_sync: bool,
    ) -> Result<StageAReport, SyncError> {
        // Deduplicate by external id, keeping the last occurrence.
        let mut by_id: HashMap<String, SourceProduct> = HashMap::new();
        let raw_len = products.len();
        for product in products {
            by_id.insert(product.external_id.clone(), product);
        }
        if by_id.len() < raw_len {
            tracing::warn!(
                discarded = raw_len - by_id.len(),
                kept = by_id.len(),
                "source returned duplicate external ids, keeping last occurrence"
            );
        }
        let unique: Vec<SourceProduct> = by_id.into_values().collect();

        let existing: HashMap<String, String> = self
            .store
            .products_for_binding(binding_id)
            .await?
            .into_iter()
            .map(|r| (r.external_id, r.content_hash))
            .collect();

        let mut report = StageAReport {
            total: unique.len(),
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::with_capacity(unique.len());

        for batch in unique.chunks(self.config.upsert_batch) {
            let mut upserts = Vec::new();
            for product in batch {
                seen.insert(product.external_id.clone());
                let hash = content_hash(product);
                match existing.get(&product.external_id) {
                    None => {
                        report.new += 1;
                        upserts.push(ProductUpsert {
                            product: product.clone(),
                            content_hash: hash,
                        });
                    }
                    Some(stored) if *stored != hash => {
                        report.updated += 1;
                        upserts.push(ProductUpsert {
                            product: product.clone(),
                            content_hash: hash,
                        });
                    }
                    Some(_) => report.unchanged += 1,
                }
            }
            if !upserts.is_empty() {
                self.store.apply_batch(binding_id, upserts).await?;
            }
        }

        // Incremental syncs fetch only modified rows, so absence from the
        // fetch says nothing; deletions happen on full syncs only.
        if full_sync {
            report.deleted = self.store.delete_absent(binding_id, &seen).await?;
        }

        tracing::info!(
            binding = %binding_id,
            new = report.new,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            "stage A complete"
        );
        Ok(report)
    }

    async fn stage_b(
        &self,
        binding_id: Uuid,
        agent_id: Uuid,
        collection: &str,
    ) -> Result<StageBReport, SyncError> {
        self.index
            .ensure_collection(collection, self.embedder.dim())
            .await?;

        let source = format!("product_sync_{agent_id}");
        let mut report = StageBReport::default();
        let mut failed_rows: HashSet<Uuid> = HashSet::new();

        loop {
            let mut pending = self
                .store
                .pending_index(binding_id, self.config.index_batch)
                .await?;
            pending.retain(|r| !failed_rows.contains(&r.id));
            if pending.is_empty() {
                break;
            }

            let texts: Vec<String> = pending.iter().map(|r| r.to_rag_text()).collect();
            let mut vectors = Vec::with_capacity(texts.len());
            let mut embed_failed = false;
            for chunk in texts.chunks(self.embedder.embed_batch_size()) {
                match self.embedder.embed(chunk).await {
                    Ok(batch) => vectors.extend(batch),
                    Err(e) => {
                        tracing::warn!(error = %e, "embedding batch failed, skipping rows");
                        embed_failed = true;
                        break;
                    }
                }
            }
            if embed_failed || vectors.len() != pending.len() {
                report.failed += pending.len();
                failed_rows.extend(pending.iter().map(|r| r.id));
                continue;
            }

            let mut points = Vec::with_capacity(pending.len());
            let mut marks = Vec::with_capacity(pending.len());
            for (row, vector) in pending.iter().zip(vectors) {
                let point_id = product_point_id(agent_id, &row.external_id);
                let mut payload = HashMap::new();
                payload.insert("text".to_string(), row.to_rag_text());
                payload.insert("namespace".to_string(), "products".to_string());
                payload.insert("source".to_string(), source.clone());
                payload.insert("product_id".to_string(), row.external_id.clone());
                payload.insert("product_name".to_string(), row.name.clone());
                payload.insert("product_db_id".to_string(), row.id.to_string());

                points.push(VectorPoint {
                    id: point_id.clone(),
                    vector,
                    payload,
                });
                marks.push(IndexMark {
                    row_id: row.id,
                    point_id,
                });
            }

            match self.index.upsert(collection, points).await {
                Ok(()) => {
                    self.store
                        .mark_indexed(binding_id, marks, Utc::now())
                        .await?;
                    report.indexed += pending.len();
                    report.batches += 1;
                }
                Err(e) => {
                    // The rows stay rag_indexed = false and will be retried
                    // on the next run.
                    tracing::warn!(error = %e, rows = pending.len(), "vector upsert failed");
                    report.failed += pending.len();
                    failed_rows.extend(pending.iter().map(|r| r.id));
                }
            }
        }

        tracing::info!(
            binding = %binding_id,
            indexed = report.indexed,
            failed = report.failed,
            "stage B complete"
        );
        Ok(report)
    }

    async fn stage_c(&self, binding_id: Uuid, agent_id: Uuid, collection: &str) -> StageCReport {
        match self.cleanup_orphans(binding_id, agent_id, collection).await {
            Ok(report) => report,
            Err(e) => {
                // Orphans are a soft constraint; the next full sync retries.
                tracing::warn!(error = %e, "orphan cleanup failed, continuing");
                StageCReport::default()
            }
        }
    }

    async fn cleanup_orphans(
        &self,
        binding_id: Uuid,
        agent_id: Uuid,
        collection: &str,
    ) -> Result<StageCReport, SyncError> {
        let surviving = self.store.indexed_point_ids(binding_id).await?;
        let filter = PayloadFilter::new().matches("source", format!("product_sync_{agent_id}"));

        let mut orphans = Vec::new();
        let mut offset = None;
        loop {
            let (page, next) = self
                .index
                .scroll(collection, &filter, 100, offset)
                .await?;
            orphans.extend(
                page.into_iter()
                    .map(|p| p.id)
                    .filter(|id| !surviving.contains(id)),
            );
            match next {
                Some(cursor) => offset = Some(cursor),
                None => break,
            }
        }

        if !orphans.is_empty() {
            self.index.delete(collection, &orphans).await?;
            tracing::info!(count = orphans.len(), "deleted orphaned vector points");
        }
        Ok(StageCReport {
            deleted_points: orphans.len(),
        })
    }
}

/// Deterministic point id: re-embedding the same product overwrites in
/// place, which is what makes orphan cleanup sound.
pub fn product_point_id(agent_id: Uuid, external_id: &str) -> String {
    let seed = format!("product:{agent_id}:{external_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_deterministic() {
        let agent = Uuid::new_v4();
        assert_eq!(product_point_id(agent, "42"), product_point_id(agent, "42"));
        assert_ne!(product_point_id(agent, "42"), product_point_id(agent, "43"));
        assert_ne!(
            product_point_id(agent, "42"),
            product_point_id(Uuid::new_v4(), "42")
        );
    }

    #[test]
    fn test_settings_defaults() {
        let binding = ToolBinding {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            tool_slug: "product_stock".into(),
            integration_slug: "wordpress".into(),
            integration_config: serde_json::json!({"use_as_rag": true}),
            enabled: true,
        };
        let settings = SyncSettings::from_binding(&binding);
        assert!(settings.use_as_rag);
        assert_eq!(settings.sync_interval_hours, 24);
    }
}
