//! End-to-end pipeline tests against an in-memory store, an in-memory
//! vector index, and a scripted catalog source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use voice_broker_core::ToolBinding;
use voice_broker_rag::{
    HashEmbedder, MemoryIndex, PayloadFilter, RagError, ScrolledPoint, SearchHit, VectorIndex,
    VectorPoint,
};
use voice_broker_sync::{
    pipeline::product_point_id, MemorySyncStore, ProductSyncService, SyncConfig, SyncError,
    SyncOutcome,
};
use voice_broker_tools::{CatalogSource, SourceProduct, ToolError, ToolIntegration};

const COLLECTION: &str = "shop_knowledge";

/// Catalog source scripted from a mutable product list. Honors
/// `modified_after` and an optional product cap the way a real commerce
/// integration does.
struct ScriptedCatalog {
    products: Mutex<Vec<SourceProduct>>,
    max_products: usize,
    fetch_delay: Option<Duration>,
}

impl ScriptedCatalog {
    fn new(products: Vec<SourceProduct>) -> Self {
        Self {
            products: Mutex::new(products),
            max_products: 0,
            fetch_delay: None,
        }
    }

    fn set_products(&self, products: Vec<SourceProduct>) {
        *self.products.lock() = products;
    }
}

#[async_trait]
impl ToolIntegration for ScriptedCatalog {
    async fn execute(&self, _arguments: &Value) -> Result<Value, ToolError> {
        Ok(json!({"success": true}))
    }

    fn as_catalog(&self) -> Option<&dyn CatalogSource> {
        Some(self)
    }
}

#[async_trait]
impl CatalogSource for ScriptedCatalog {
    async fn fetch_all_products(
        &self,
        modified_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceProduct>, ToolError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut products: Vec<SourceProduct> = self
            .products
            .lock()
            .iter()
            .filter(|p| match modified_after {
                Some(since) => p.source_updated_at.map_or(false, |t| t > since),
                None => true,
            })
            .cloned()
            .collect();
        if self.max_products > 0 {
            products.truncate(self.max_products);
        }
        Ok(products)
    }
}

/// Vector index wrapper that fails the first N upserts.
struct FlakyIndex {
    inner: MemoryIndex,
    failures_left: AtomicUsize,
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), RagError> {
        self.inner.ensure_collection(name, dim).await
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), RagError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RagError::VectorStore("injected upsert failure".into()));
        }
        self.inner.upsert(name, points).await
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>, RagError> {
        self.inner.search(name, vector, k, filter).await
    }

    async fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        limit: usize,
        offset: Option<String>,
    ) -> Result<(Vec<ScrolledPoint>, Option<String>), RagError> {
        self.inner.scroll(name, filter, limit, offset).await
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), RagError> {
        self.inner.delete(name, ids).await
    }
}

fn product(external_id: &str, name: &str, modified: Option<DateTime<Utc>>) -> SourceProduct {
    let mut p = SourceProduct::new(external_id, name);
    p.description = Some(format!("{name} description"));
    p.price = Some("10.00".into());
    p.currency = Some("EUR".into());
    p.source_updated_at = modified;
    p
}

fn binding() -> ToolBinding {
    ToolBinding {
        id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        tool_slug: "product_stock".into(),
        integration_slug: "wordpress".into(),
        integration_config: json!({"use_as_rag": true, "sync_interval_hours": 0}),
        enabled: true,
    }
}

struct Harness {
    store: Arc<MemorySyncStore>,
    index: Arc<MemoryIndex>,
    service: ProductSyncService,
}

fn harness() -> Harness {
    let store = Arc::new(MemorySyncStore::new());
    let index = Arc::new(MemoryIndex::new());
    let service = ProductSyncService::new(
        store.clone(),
        index.clone(),
        Arc::new(HashEmbedder::new(32)),
        SyncConfig::default(),
    );
    Harness {
        store,
        index,
        service,
    }
}

fn completed(outcome: SyncOutcome) -> voice_broker_sync::SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
    }
}

#[tokio::test]
async fn test_full_sync_new_update_delete_and_orphan_cleanup() {
    let h = harness();
    let binding = binding();
    let agent_id = binding.agent_id;

    // Seed: A and B, fully synced and indexed.
    let catalog = ScriptedCatalog::new(vec![
        product("A", "Product A", None),
        product("B", "Product B", None),
    ]);
    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.new, 2);
    assert_eq!(report.stage_b.indexed, 2);
    assert!(h.index.contains_point(COLLECTION, &product_point_id(agent_id, "B")));

    // Source now has a modified A and a new C; B is gone.
    let mut modified_a = product("A", "Product A", None);
    modified_a.price = Some("12.00".into());
    catalog.set_products(vec![modified_a, product("C", "Product C", None)]);

    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.new, 1);
    assert_eq!(report.stage_a.updated, 1);
    assert_eq!(report.stage_a.unchanged, 0);
    assert_eq!(report.stage_a.deleted, 1);

    // Stage B: both survivors indexed.
    assert!(h.store.row(binding.id, "A").unwrap().rag_indexed);
    assert!(h.store.row(binding.id, "C").unwrap().rag_indexed);

    // Stage C: the vector store holds points for A and C only.
    let stage_c = report.stage_c.expect("full sync with deletions runs cleanup");
    assert_eq!(stage_c.deleted_points, 1);
    assert!(h.index.contains_point(COLLECTION, &product_point_id(agent_id, "A")));
    assert!(h.index.contains_point(COLLECTION, &product_point_id(agent_id, "C")));
    assert!(!h.index.contains_point(COLLECTION, &product_point_id(agent_id, "B")));
}

#[tokio::test]
async fn test_second_full_sync_is_idempotent() {
    let h = harness();
    let binding = binding();
    let catalog = ScriptedCatalog::new(vec![
        product("A", "Product A", None),
        product("B", "Product B", None),
    ]);

    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    let second = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );

    assert_eq!(second.stage_a.new, 0);
    assert_eq!(second.stage_a.updated, 0);
    assert_eq!(second.stage_a.unchanged, 2);
    assert_eq!(second.stage_a.deleted, 0);
    assert_eq!(second.stage_b.indexed, 0);
    assert_eq!(h.index.point_count(COLLECTION), 2);
}

#[tokio::test]
async fn test_toggle_and_revert_restores_hash_and_stays_indexed() {
    let h = harness();
    let binding = binding();
    let catalog = ScriptedCatalog::new(vec![product("A", "Product A", None)]);

    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    let original_hash = h.store.row(binding.id, "A").unwrap().content_hash;

    // Rename, then incremental sync picks up only the modified row.
    catalog.set_products(vec![product("A", "Product A renamed", Some(Utc::now()))]);
    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, false)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.updated, 1);
    assert_ne!(h.store.row(binding.id, "A").unwrap().content_hash, original_hash);

    // Rename back; the hash must return to its original value and the row
    // must be indexed at rest.
    catalog.set_products(vec![product("A", "Product A", Some(Utc::now()))]);
    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, false)
            .await
            .unwrap(),
    );
    let row = h.store.row(binding.id, "A").unwrap();
    assert_eq!(row.content_hash, original_hash);
    assert!(row.rag_indexed);
}

#[tokio::test]
async fn test_incremental_sync_never_deletes() {
    let h = harness();
    let binding = binding();
    let catalog = ScriptedCatalog::new(vec![
        product("A", "Product A", None),
        product("B", "Product B", None),
    ]);
    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );

    // Incremental fetch returns only the modified A; B's absence from the
    // fetch must not delete it.
    catalog.set_products(vec![product("A", "Product A v2", Some(Utc::now()))]);
    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, false)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.deleted, 0);
    assert!(h.store.row(binding.id, "B").is_some());
    assert!(report.stage_c.is_none());
}

#[tokio::test]
async fn test_max_products_caps_synced_rows() {
    let h = harness();
    let binding = binding();
    let mut catalog = ScriptedCatalog::new(
        (0..5)
            .map(|i| product(&i.to_string(), &format!("Product {i}"), None))
            .collect(),
    );
    catalog.max_products = 3;

    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.new, 3);
    let status = h.service.status(binding.id).await.unwrap();
    assert_eq!(status.stats.total_products, 3);
}

#[tokio::test]
async fn test_interval_gate_skips_until_due() {
    let h = harness();
    let mut binding = binding();
    binding.integration_config = json!({"use_as_rag": true, "sync_interval_hours": 24});
    let catalog = ScriptedCatalog::new(vec![product("A", "Product A", None)]);

    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    match h
        .service
        .run_sync(&binding, &catalog, COLLECTION, false)
        .await
        .unwrap()
    {
        SyncOutcome::Skipped { reason } => assert!(reason.contains("not due")),
        SyncOutcome::Completed(_) => panic!("expected interval skip"),
    }

    // Forcing bypasses the interval.
    completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
}

#[tokio::test]
async fn test_rag_disabled_binding_is_rejected() {
    let h = harness();
    let mut binding = binding();
    binding.integration_config = json!({"use_as_rag": false});
    let catalog = ScriptedCatalog::new(vec![]);

    assert!(matches!(
        h.service.run_sync(&binding, &catalog, COLLECTION, true).await,
        Err(SyncError::NotEnabled)
    ));
}

#[tokio::test]
async fn test_stage_b_failure_leaves_rows_pending_and_retries() {
    let store = Arc::new(MemorySyncStore::new());
    let flaky = Arc::new(FlakyIndex {
        inner: MemoryIndex::new(),
        failures_left: AtomicUsize::new(1),
    });
    let service = ProductSyncService::new(
        store.clone(),
        flaky.clone(),
        Arc::new(HashEmbedder::new(32)),
        SyncConfig::default(),
    );
    let binding = binding();
    let catalog = ScriptedCatalog::new(vec![product("A", "Product A", None)]);

    let report = completed(
        service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_b.indexed, 0);
    assert_eq!(report.stage_b.failed, 1);
    // Partial progress is durable: the row survives, still pending.
    assert!(!store.row(binding.id, "A").unwrap().rag_indexed);

    // A later index-only pass picks the row back up.
    let retry = service.index_only(&binding, COLLECTION).await.unwrap();
    assert_eq!(retry.indexed, 1);
    assert!(store.row(binding.id, "A").unwrap().rag_indexed);
}

#[tokio::test]
async fn test_concurrent_sync_for_same_binding_skips() {
    let h = harness();
    let binding = binding();
    let mut catalog = ScriptedCatalog::new(vec![product("A", "Product A", None)]);
    catalog.fetch_delay = Some(Duration::from_millis(100));
    let catalog = Arc::new(catalog);
    let service = Arc::new(h.service);

    let b1 = binding.clone();
    let c1 = catalog.clone();
    let s1 = service.clone();
    let first = tokio::spawn(async move { s1.run_sync(&b1, c1.as_ref(), COLLECTION, true).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = service
        .run_sync(&binding, catalog.as_ref(), COLLECTION, true)
        .await
        .unwrap();
    match second {
        SyncOutcome::Skipped { reason } => assert!(reason.contains("in progress")),
        SyncOutcome::Completed(_) => panic!("second sync should have been skipped"),
    }

    completed(first.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_duplicate_external_ids_keep_last_occurrence() {
    let h = harness();
    let binding = binding();
    let mut first = product("A", "Product A old", None);
    first.price = Some("1.00".into());
    let second = product("A", "Product A new", None);
    let catalog = ScriptedCatalog::new(vec![first, second]);

    let report = completed(
        h.service
            .run_sync(&binding, &catalog, COLLECTION, true)
            .await
            .unwrap(),
    );
    assert_eq!(report.stage_a.new, 1);
    assert_eq!(h.store.row(binding.id, "A").unwrap().name, "Product A new");
}
