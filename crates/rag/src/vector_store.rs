//! Vector index contract and implementations.
//!
//! The broker consumes a narrow slice of a vector store: ensure a
//! collection with the right dimension, idempotent upserts on deterministic
//! ids, filtered search, filtered scroll for orphan scans, and deletion.
//! `QdrantIndex` backs production; `MemoryIndex` backs tests and keeps the
//! same observable behavior.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, Condition, CreateCollectionBuilder, DeletePointsBuilder,
    Distance, FieldCondition, Filter, Match, PointId, PointStruct, PointsIdsList,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;

use crate::RagError;

/// A point ready for upsert. Payload values are strings; that is all the
/// broker stores.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, String>,
}

/// A scored search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, String>,
}

/// A point id surfaced by a scroll pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrolledPoint {
    pub id: String,
}

/// Exact-match payload filter; all entries must match.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub must: Vec<(String, String)>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    fn accepts(&self, payload: &HashMap<String, String>) -> bool {
        self.must
            .iter()
            .all(|(k, v)| payload.get(k).map_or(false, |p| p == v))
    }
}

/// The vector store contract consumed by retrieval and sync.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing. An existing collection with a
    /// different dimension is recreated (destructive, logged).
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), RagError>;

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), RagError>;

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>, RagError>;

    /// Page through point ids matching the filter. `offset` is the cursor
    /// returned by the previous page; `None` result cursor means done.
    async fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        limit: usize,
        offset: Option<String>,
    ) -> Result<(Vec<ScrolledPoint>, Option<String>), RagError>;

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), RagError>;
}

// ---------------------------------------------------------------------------
// Qdrant implementation
// ---------------------------------------------------------------------------

/// Qdrant configuration.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6334".to_string(),
            api_key: None,
        }
    }
}

/// Qdrant-backed index.
pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    pub fn new(config: QdrantConfig) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    async fn collection_dim(&self, name: &str) -> Result<Option<usize>, RagError> {
        let info = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        let dim = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|c| match c {
                vectors_config::Config::Params(params) => Some(params.size as usize),
                _ => None,
            });
        Ok(dim)
    }

    async fn create(&self, name: &str, dim: usize) -> Result<(), RagError> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }
}

fn to_qdrant_filter(filter: &PayloadFilter) -> Filter {
    let conditions: Vec<Condition> = filter
        .must
        .iter()
        .map(|(key, value)| Condition {
            condition_one_of: Some(qdrant_client::qdrant::condition::ConditionOneOf::Field(
                FieldCondition {
                    key: key.clone(),
                    r#match: Some(Match {
                        match_value: Some(qdrant_client::qdrant::r#match::MatchValue::Keyword(
                            value.clone(),
                        )),
                    }),
                    ..Default::default()
                },
            )),
        })
        .collect();

    Filter {
        must: conditions,
        ..Default::default()
    }
}

fn point_id_string(id: Option<PointId>) -> String {
    id.map(|pid| match pid.point_id_options {
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => u,
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    })
    .unwrap_or_default()
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        if !exists {
            return self.create(name, dim).await;
        }

        if let Some(actual) = self.collection_dim(name).await? {
            if actual != dim {
                tracing::warn!(
                    collection = name,
                    actual,
                    expected = dim,
                    "collection dimension mismatch, recreating (destructive)"
                );
                self.client
                    .delete_collection(name)
                    .await
                    .map_err(|e| RagError::VectorStore(e.to_string()))?;
                return self.create(name, dim).await;
            }
        }
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), RagError> {
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let payload: HashMap<String, qdrant_client::qdrant::Value> = p
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, v.into()))
                    .collect();
                PointStruct::new(p.id, p.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>, RagError> {
        let mut builder =
            SearchPointsBuilder::new(name, vector.to_vec(), k as u64).with_payload(true);
        if let Some(f) = filter {
            builder = builder.filter(to_qdrant_filter(f));
        }

        let results = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let mut payload = HashMap::new();
                for (k, v) in point.payload {
                    if let Some(Kind::StringValue(s)) = v.kind {
                        payload.insert(k, s);
                    }
                }
                SearchHit {
                    id: point_id_string(point.id),
                    score: point.score,
                    payload,
                }
            })
            .collect())
    }

    async fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        limit: usize,
        offset: Option<String>,
    ) -> Result<(Vec<ScrolledPoint>, Option<String>), RagError> {
        let mut builder = ScrollPointsBuilder::new(name)
            .filter(to_qdrant_filter(filter))
            .limit(limit as u32)
            .with_payload(false)
            .with_vectors(false);
        if let Some(cursor) = offset {
            builder = builder.offset(PointId::from(cursor));
        }

        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        let points = response
            .result
            .into_iter()
            .map(|p| ScrolledPoint {
                id: point_id_string(p.id),
            })
            .collect();
        let next = response.next_page_offset.map(|pid| point_id_string(Some(pid)));
        Ok((points, next))
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), RagError> {
        let points: Vec<PointId> = ids.iter().map(|id| PointId::from(id.clone())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(name).points(PointsIdsList { ids: points }),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryCollection {
    dim: usize,
    points: HashMap<String, (Vec<f32>, HashMap<String, String>)>,
}

/// In-memory index with the same observable behavior as the Qdrant one,
/// including destructive recreation on dimension mismatch.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self, name: &str) -> usize {
        self.collections
            .read()
            .get(name)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }

    pub fn contains_point(&self, name: &str, id: &str) -> bool {
        self.collections
            .read()
            .get(name)
            .map(|c| c.points.contains_key(id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), RagError> {
        let mut collections = self.collections.write();
        match collections.get(name) {
            Some(existing) if existing.dim == dim => {}
            Some(existing) => {
                tracing::warn!(
                    collection = name,
                    actual = existing.dim,
                    expected = dim,
                    "collection dimension mismatch, recreating (destructive)"
                );
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        dim,
                        points: HashMap::new(),
                    },
                );
            }
            None => {
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        dim,
                        points: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), RagError> {
        let mut collections = self.collections.write();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| RagError::VectorStore(format!("unknown collection {name}")))?;
        for p in points {
            collection.points.insert(p.id, (p.vector, p.payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>, RagError> {
        let collections = self.collections.read();
        let collection = collections
            .get(name)
            .ok_or_else(|| RagError::Search(format!("unknown collection {name}")))?;

        let mut hits: Vec<SearchHit> = collection
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.map_or(true, |f| f.accepts(payload)))
            .map(|(id, (v, payload))| {
                let score: f32 = v.iter().zip(vector).map(|(a, b)| a * b).sum();
                SearchHit {
                    id: id.clone(),
                    score,
                    payload: payload.clone(),
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        limit: usize,
        offset: Option<String>,
    ) -> Result<(Vec<ScrolledPoint>, Option<String>), RagError> {
        let collections = self.collections.read();
        let collection = collections
            .get(name)
            .ok_or_else(|| RagError::VectorStore(format!("unknown collection {name}")))?;

        let mut ids: Vec<String> = collection
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.accepts(payload))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        let start = match offset {
            Some(cursor) => ids.iter().position(|id| *id > cursor).unwrap_or(ids.len()),
            None => 0,
        };
        let page: Vec<ScrolledPoint> = ids[start..]
            .iter()
            .take(limit)
            .map(|id| ScrolledPoint { id: id.clone() })
            .collect();
        let next = if start + page.len() < ids.len() {
            page.last().map(|p| p.id.clone())
        } else {
            None
        };
        Ok((page, next))
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), RagError> {
        let mut collections = self.collections.write();
        if let Some(collection) = collections.get_mut(name) {
            for id in ids {
                collection.points.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, source: &str) -> VectorPoint {
        let mut payload = HashMap::new();
        payload.insert("source".to_string(), source.to_string());
        VectorPoint {
            id: id.to_string(),
            vector,
            payload,
        }
    }

    #[tokio::test]
    async fn test_memory_search_orders_by_score() {
        let index = MemoryIndex::new();
        index.ensure_collection("c", 2).await.unwrap();
        index
            .upsert(
                "c",
                vec![
                    point("a", vec![1.0, 0.0], "s"),
                    point("b", vec![0.6, 0.8], "s"),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("c", &[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn test_memory_filter_restricts_search_and_scroll() {
        let index = MemoryIndex::new();
        index.ensure_collection("c", 2).await.unwrap();
        index
            .upsert(
                "c",
                vec![
                    point("a", vec![1.0, 0.0], "sync_1"),
                    point("b", vec![1.0, 0.0], "sync_2"),
                ],
            )
            .await
            .unwrap();

        let filter = PayloadFilter::new().matches("source", "sync_1");
        let hits = index.search("c", &[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let (page, next) = index.scroll("c", &filter, 10, None).await.unwrap();
        assert_eq!(page, vec![ScrolledPoint { id: "a".into() }]);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_memory_scroll_pages_with_cursor() {
        let index = MemoryIndex::new();
        index.ensure_collection("c", 1).await.unwrap();
        let points: Vec<VectorPoint> = (0..5)
            .map(|i| point(&format!("p{i}"), vec![1.0], "s"))
            .collect();
        index.upsert("c", points).await.unwrap();

        let filter = PayloadFilter::new().matches("source", "s");
        let (first, cursor) = index.scroll("c", &filter, 2, None).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = cursor.expect("more pages expected");

        let (second, cursor2) = index.scroll("c", &filter, 2, Some(cursor)).await.unwrap();
        assert_eq!(second.len(), 2);
        let (third, done) = index.scroll("c", &filter, 2, cursor2).await.unwrap();
        assert_eq!(third.len(), 1);
        assert!(done.is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_recreates() {
        let index = MemoryIndex::new();
        index.ensure_collection("c", 2).await.unwrap();
        index.upsert("c", vec![point("a", vec![1.0, 0.0], "s")]).await.unwrap();
        assert_eq!(index.point_count("c"), 1);

        index.ensure_collection("c", 3).await.unwrap();
        assert_eq!(index.point_count("c"), 0, "recreation drops points");
    }
}
