//! The vector index seam and an in-process implementation.

use crate::embeddings::cosine_similarity;
use crate::error::RagError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Metadata key selecting the distance function.
pub const SPACE_KEY: &str = "hnsw:space";
/// Metadata key naming the embedding model used for a collection.
pub const EMBEDDING_FUNC_KEY: &str = "embedding_func_name";
pub const CREATED_AT_KEY: &str = "created_at";

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub document: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub distance: f32,
}

/// Distance functions understood by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Cosine,
    L2,
    InnerProduct,
}

impl Space {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        match metadata.get(SPACE_KEY).and_then(Value::as_str) {
            Some("l2") => Self::L2,
            Some("ip") => Self::InnerProduct,
            _ => Self::Cosine,
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::InnerProduct => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }
}

/// Operations the gateway needs from a vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn create_collection(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<CollectionInfo, RagError>;

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, RagError>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, RagError>;

    async fn delete_collection(&self, name: &str) -> Result<(), RagError>;

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), RagError>;

    /// Up to `n_results` neighbours of `embedding`, nearest first.
    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        n_results: usize,
    ) -> Result<Vec<Neighbor>, RagError>;

    async fn count(&self, collection: &str) -> Result<usize, RagError>;

    /// Backend name for logs and health output.
    fn name(&self) -> &str;
}

#[derive(Debug)]
struct MemoryCollection {
    info: CollectionInfo,
    rows: BTreeMap<String, VectorRecord>,
}

/// Exact-search index kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    collections: RwLock<BTreeMap<String, MemoryCollection>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn create_collection(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<CollectionInfo, RagError> {
        let mut all = self.collections.write().unwrap_or_else(|p| p.into_inner());
        if all.contains_key(name) {
            return Err(RagError::CollectionExists(name.to_string()));
        }
        let info = CollectionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            metadata,
        };
        all.insert(
            name.to_string(),
            MemoryCollection {
                info: info.clone(),
                rows: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, RagError> {
        let all = self.collections.read().unwrap_or_else(|p| p.into_inner());
        all.get(name)
            .map(|c| c.info.clone())
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, RagError> {
        let all = self.collections.read().unwrap_or_else(|p| p.into_inner());
        Ok(all.values().map(|c| c.info.clone()).collect())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), RagError> {
        let mut all = self.collections.write().unwrap_or_else(|p| p.into_inner());
        all.remove(name)
            .map(|_| ())
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))
    }

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), RagError> {
        let mut all = self.collections.write().unwrap_or_else(|p| p.into_inner());
        let target = all
            .get_mut(collection)
            .ok_or_else(|| RagError::CollectionNotFound(collection.to_string()))?;
        for record in records {
            target.rows.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        n_results: usize,
    ) -> Result<Vec<Neighbor>, RagError> {
        let all = self.collections.read().unwrap_or_else(|p| p.into_inner());
        let target = all
            .get(collection)
            .ok_or_else(|| RagError::CollectionNotFound(collection.to_string()))?;
        let space = Space::from_metadata(&target.info.metadata);

        let mut hits: Vec<Neighbor> = target
            .rows
            .values()
            .map(|row| Neighbor {
                id: row.id.clone(),
                document: row.document.clone(),
                metadata: row.metadata.clone(),
                distance: space.distance(&embedding, &row.embedding),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<usize, RagError> {
        let all = self.collections.read().unwrap_or_else(|p| p.into_inner());
        all.get(collection)
            .map(|c| c.rows.len())
            .ok_or_else(|| RagError::CollectionNotFound(collection.to_string()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
