//! The vector store gateway.
//!
//! Owns the index connection and the embedder, stamps collection metadata,
//! batches inserts and turns raw neighbours into threshold-aware results.

use crate::chroma::ChromaIndex;
use crate::chunking::{ChunkStrategy, DocumentChunk, chunk_document};
use crate::corpus::INTERNAL_KNOWLEDGE;
use crate::embeddings::{Embedder, EmbedderRegistry};
use crate::error::RagError;
use crate::retrieval::{RetrievalResult, apply_threshold};
use crate::vector::{
    CREATED_AT_KEY, CollectionInfo, EMBEDDING_FUNC_KEY, InMemoryIndex, Metadata, SPACE_KEY,
    VectorIndex, VectorRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use studio_core::config::{RagConfig, VectorBackend};
use studio_core::error::StudioError;
use tracing::{debug, info};

/// Upper bound on rows per insert call.
pub const MAX_BATCH: usize = 166;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub default_collection: String,
    pub distance_threshold: f32,
    pub n_results: usize,
    pub min_documents: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            default_collection: config.default_collection.clone(),
            distance_threshold: config.distance_threshold,
            n_results: config.n_results,
            min_documents: config.min_documents,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

/// Per-query overrides of the configured retrieval settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub n_results: Option<usize>,
    pub distance_threshold: Option<f32>,
    pub min_documents: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSummary {
    #[serde(flatten)]
    pub info: CollectionInfo,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub collection: String,
    pub document_id: String,
    pub chunks: usize,
}

/// Collection names follow the strictest backend: 3 to 63 characters of
/// `[A-Za-z0-9._-]`, starting and ending alphanumeric.
pub fn validate_collection_name(name: &str) -> Result<(), RagError> {
    let ok_len = (3..=63).contains(&name.len());
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    let ok_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if ok_len && ok_chars && ok_ends {
        Ok(())
    } else {
        Err(RagError::InvalidRequest(format!(
            "invalid collection name '{name}': use 3-63 letters, digits, '.', '_' or '-'"
        )))
    }
}

#[derive(Clone)]
pub struct VectorGateway {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    settings: GatewaySettings,
}

impl std::fmt::Debug for VectorGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorGateway")
            .field("index", &self.index.name())
            .field("embedder", &self.embedder.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl VectorGateway {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            index,
            embedder,
            settings,
        }
    }

    /// Connect the configured index and load the configured embedder.
    pub fn from_config(config: &RagConfig, registry: &EmbedderRegistry) -> Result<Self, RagError> {
        let index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Chroma => Arc::new(ChromaIndex::from_config(config)?),
            VectorBackend::Memory => Arc::new(InMemoryIndex::new()),
        };
        let embedder = registry.get(&config.embedding_model)?;
        info!(
            index = index.name(),
            embedder = embedder.name(),
            "Vector gateway ready"
        );
        Ok(Self::new(index, embedder, GatewaySettings::from_config(config)))
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn create_collection(&self, name: &str) -> Result<CollectionInfo, StudioError> {
        validate_collection_name(name)?;
        let mut metadata = Metadata::new();
        metadata.insert(SPACE_KEY.into(), json!("cosine"));
        metadata.insert(EMBEDDING_FUNC_KEY.into(), json!(self.embedder.name()));
        metadata.insert(CREATED_AT_KEY.into(), json!(chrono::Utc::now().to_rfc3339()));
        let info = self.index.create_collection(name, metadata).await?;
        info!(collection = name, "Collection created");
        Ok(info)
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StudioError> {
        Ok(self.index.list_collections().await?)
    }

    pub async fn get_collection(&self, name: &str) -> Result<CollectionSummary, StudioError> {
        let info = self.index.get_collection(name).await?;
        let count = self.index.count(name).await?;
        Ok(CollectionSummary { info, count })
    }

    pub async fn delete_collection(&self, name: &str) -> Result<(), StudioError> {
        self.index.delete_collection(name).await?;
        info!(collection = name, "Collection deleted");
        Ok(())
    }

    /// Embed and store chunks, at most [`MAX_BATCH`] per call.
    pub async fn insert(
        &self,
        collection: &str,
        chunks: Vec<DocumentChunk>,
    ) -> Result<usize, StudioError> {
        let total = chunks.len();
        for batch in chunks.chunks(MAX_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            if embeddings.len() != batch.len() {
                return Err(RagError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                ))
                .into());
            }
            let records = batch
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| VectorRecord {
                    id: chunk.id.clone(),
                    document: chunk.text.clone(),
                    embedding,
                    metadata: chunk.metadata.clone(),
                })
                .collect();
            self.index.add(collection, records).await?;
            debug!(collection, rows = batch.len(), "Inserted batch");
        }
        Ok(total)
    }

    /// Chunk a plain-text document and insert it.
    pub async fn ingest(
        &self,
        collection: &str,
        text: &str,
        source: &str,
        document_id: Option<String>,
        strategy: ChunkStrategy,
    ) -> Result<IngestReport, StudioError> {
        let document_id = document_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let chunks = chunk_document(text, source, &document_id, strategy);
        if chunks.is_empty() {
            return Err(StudioError::invalid_request("document has no text"));
        }
        // fail before embedding anything when the collection is missing
        self.index.get_collection(collection).await?;
        let inserted = self.insert(collection, chunks).await?;
        info!(collection, document_id = %document_id, chunks = inserted, "Document ingested");
        Ok(IngestReport {
            collection: collection.to_string(),
            document_id,
            chunks: inserted,
        })
    }

    /// Nearest neighbours of `query`, filtered by distance and classified.
    pub async fn query(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<RetrievalResult, StudioError> {
        if query.trim().is_empty() {
            return Err(StudioError::invalid_request("query is empty"));
        }
        let n_results = options.n_results.unwrap_or(self.settings.n_results).max(1);
        let threshold = options
            .distance_threshold
            .unwrap_or(self.settings.distance_threshold);
        let min_documents = options.min_documents.unwrap_or(self.settings.min_documents);

        let embedding = self.embedder.embed(query).await?;
        let neighbors = self.index.query(collection, embedding, n_results).await?;
        let result = apply_threshold(query, collection, neighbors, threshold, min_documents);
        debug!(
            collection,
            raw = result.raw_count,
            kept = result.filtered_count,
            best = ?result.best_distance,
            confidence = result.confidence_level.as_str(),
            "Retrieval finished"
        );
        Ok(result)
    }

    /// Create and seed the default collection if it is missing. Returns
    /// whether it was created.
    pub async fn ensure_default_collection(&self) -> Result<bool, StudioError> {
        let name = self.settings.default_collection.clone();
        match self.index.get_collection(&name).await {
            Ok(_) => return Ok(false),
            Err(RagError::CollectionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.create_collection(&name).await?;
        let chunks: Vec<DocumentChunk> = INTERNAL_KNOWLEDGE
            .iter()
            .flat_map(|doc| chunk_document(doc.text, doc.title, doc.id, ChunkStrategy::default()))
            .collect();
        let inserted = self.insert(&name, chunks).await?;
        info!(collection = %name, chunks = inserted, "Seeded internal knowledge");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::retrieval::ConfidenceLevel;
    use crate::vector::Neighbor;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use studio_core::error::ErrorKind;

    /// Records the size of every `add` call.
    #[derive(Default)]
    struct CountingIndex {
        inner: InMemoryIndex,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        async fn create_collection(&self, name: &str, m: Metadata) -> Result<CollectionInfo, RagError> {
            self.inner.create_collection(name, m).await
        }
        async fn get_collection(&self, name: &str) -> Result<CollectionInfo, RagError> {
            self.inner.get_collection(name).await
        }
        async fn list_collections(&self) -> Result<Vec<CollectionInfo>, RagError> {
            self.inner.list_collections().await
        }
        async fn delete_collection(&self, name: &str) -> Result<(), RagError> {
            self.inner.delete_collection(name).await
        }
        async fn add(&self, c: &str, records: Vec<VectorRecord>) -> Result<(), RagError> {
            self.batches.lock().unwrap().push(records.len());
            self.inner.add(c, records).await
        }
        async fn query(&self, c: &str, e: Vec<f32>, n: usize) -> Result<Vec<Neighbor>, RagError> {
            self.inner.query(c, e, n).await
        }
        async fn count(&self, c: &str) -> Result<usize, RagError> {
            self.inner.count(c).await
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    fn gateway(index: Arc<dyn VectorIndex>) -> VectorGateway {
        VectorGateway::new(
            index,
            Arc::new(LocalEmbedder::new("local-hash-384", 384)),
            GatewaySettings::default(),
        )
    }

    fn chunk(i: usize) -> DocumentChunk {
        DocumentChunk {
            id: format!("c{i}"),
            text: format!("chunk number {i}"),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_inserts_are_batched() {
        let index = Arc::new(CountingIndex::default());
        let gw = gateway(index.clone());
        gw.create_collection("bulk").await.unwrap();
        let inserted = gw.insert("bulk", (0..400).map(chunk).collect()).await.unwrap();
        assert_eq!(inserted, 400);
        assert_eq!(*index.batches.lock().unwrap(), vec![166, 166, 68]);
        assert_eq!(gw.get_collection("bulk").await.unwrap().count, 400);
    }

    #[tokio::test]
    async fn test_collection_metadata_is_stamped() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        let info = gw.create_collection("docs").await.unwrap();
        assert_eq!(info.metadata[SPACE_KEY], "cosine");
        assert_eq!(info.metadata[EMBEDDING_FUNC_KEY], "local-hash-384");
        assert!(info.metadata.contains_key(CREATED_AT_KEY));
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_names() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        let err = gw.create_collection("x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        let err = gw.create_collection("-bad-").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        gw.create_collection("docs").await.unwrap();
        let err = gw.create_collection("docs").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        gw.create_collection("cards").await.unwrap();
        let report = gw
            .ingest(
                "cards",
                "The N300 card has two Wormhole chips. Bananas are yellow.",
                "cards.txt",
                Some("cards-doc".into()),
                ChunkStrategy::Sentence { sentences: 1, overlap: 0 },
            )
            .await
            .unwrap();
        assert_eq!(report.chunks, 2);

        let result = gw
            .query("cards", "how many wormhole chips does the n300 card have", &QueryOptions::default())
            .await
            .unwrap();
        assert!(result.is_answerable);
        assert_eq!(result.documents[0].id, "cards-doc-0");
        assert_eq!(result.documents[0].metadata["source"], "cards.txt");
    }

    #[tokio::test]
    async fn test_ingest_into_missing_collection() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        let err = gw
            .ingest("ghost", "text", "a.txt", None, ChunkStrategy::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_strict_threshold_makes_query_insufficient() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        gw.create_collection("misc").await.unwrap();
        gw.ingest("misc", "Bananas are yellow.", "f.txt", None, ChunkStrategy::default())
            .await
            .unwrap();
        let options = QueryOptions {
            distance_threshold: Some(0.05),
            ..Default::default()
        };
        let result = gw.query("misc", "quantum chromodynamics", &options).await.unwrap();
        assert_eq!(result.raw_count, 1);
        assert_eq!(result.filtered_count, 0);
        assert_eq!(result.confidence_level, ConfidenceLevel::Insufficient);
    }

    #[tokio::test]
    async fn test_default_collection_seeded_once() {
        let gw = gateway(Arc::new(InMemoryIndex::new()));
        assert!(gw.ensure_default_collection().await.unwrap());
        let seeded = gw
            .get_collection(&gw.settings().default_collection)
            .await
            .unwrap();
        assert!(seeded.count >= INTERNAL_KNOWLEDGE.len());
        assert!(!gw.ensure_default_collection().await.unwrap());
        let again = gw
            .get_collection(&gw.settings().default_collection)
            .await
            .unwrap();
        assert_eq!(again.count, seeded.count);
    }
}
