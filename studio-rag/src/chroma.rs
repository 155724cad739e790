//! Chroma REST client (`/api/v1`).

use crate::error::RagError;
use crate::vector::{CollectionInfo, Metadata, Neighbor, VectorIndex, VectorRecord};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use studio_core::config::RagConfig;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChromaIndex {
    http: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
}

impl QueryResponse {
    /// Flatten the first (only) query of a batched response.
    fn into_neighbors(self) -> Result<Vec<Neighbor>, RagError> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let mut documents = self
            .documents
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default()
            .into_iter();
        let mut metadatas = self
            .metadatas
            .and_then(|m| m.into_iter().next())
            .unwrap_or_default()
            .into_iter();
        let distances = self
            .distances
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();
        if distances.len() != ids.len() {
            return Err(RagError::Decode(format!(
                "{} ids but {} distances",
                ids.len(),
                distances.len()
            )));
        }
        Ok(ids
            .into_iter()
            .zip(distances)
            .map(|(id, distance)| Neighbor {
                id,
                document: documents.next().flatten().unwrap_or_default(),
                metadata: metadatas.next().flatten().unwrap_or_default(),
                distance,
            })
            .collect())
    }
}

/// Classify a failed Chroma call. Chroma reports missing and duplicate
/// collections through message text rather than distinct status codes.
fn classify_failure(status: u16, body: String, collection: &str) -> RagError {
    let lowered = body.to_lowercase();
    if status == 404 || lowered.contains("does not exist") || lowered.contains("not found") {
        RagError::CollectionNotFound(collection.to_string())
    } else if status == 409 || lowered.contains("already exists") {
        RagError::CollectionExists(collection.to_string())
    } else {
        RagError::Store { status, body }
    }
}

impl ChromaIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RagError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn from_config(config: &RagConfig) -> Result<Self, RagError> {
        Self::new(
            &format!("http://{}:{}", config.chroma_host, config.chroma_port),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        collection: &str,
    ) -> Result<T, RagError> {
        let url = format!("{}/api/v1{path}", self.base_url);
        debug!(%method, %url, "Chroma request");
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RagError::from_reqwest(e, self.timeout_secs))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), body, collection));
        }
        resp.json::<T>()
            .await
            .map_err(|e| RagError::from_reqwest(e, self.timeout_secs))
    }

    /// Chroma addresses rows by collection id, not name.
    async fn collection_id(&self, name: &str) -> Result<String, RagError> {
        Ok(self.get_collection(name).await?.id)
    }

    pub async fn heartbeat(&self) -> Result<(), RagError> {
        self.call::<Value>(Method::GET, "/heartbeat", None, "")
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn create_collection(
        &self,
        name: &str,
        metadata: Metadata,
    ) -> Result<CollectionInfo, RagError> {
        let body = json!({ "name": name, "metadata": metadata, "get_or_create": false });
        self.call(Method::POST, "/collections", Some(body), name).await
    }

    async fn get_collection(&self, name: &str) -> Result<CollectionInfo, RagError> {
        self.call(Method::GET, &format!("/collections/{name}"), None, name)
            .await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, RagError> {
        self.call(Method::GET, "/collections", None, "").await
    }

    async fn delete_collection(&self, name: &str) -> Result<(), RagError> {
        self.call::<Value>(Method::DELETE, &format!("/collections/{name}"), None, name)
            .await
            .map(|_| ())
    }

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), RagError> {
        if records.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(collection).await?;
        let mut ids = Vec::with_capacity(records.len());
        let mut embeddings = Vec::with_capacity(records.len());
        let mut documents = Vec::with_capacity(records.len());
        let mut metadatas = Vec::with_capacity(records.len());
        for r in records {
            ids.push(r.id);
            embeddings.push(r.embedding);
            documents.push(r.document);
            metadatas.push(r.metadata);
        }
        let body = json!({
            "ids": ids,
            "embeddings": embeddings,
            "documents": documents,
            "metadatas": metadatas,
        });
        self.call::<Value>(Method::POST, &format!("/collections/{id}/add"), Some(body), collection)
            .await
            .map(|_| ())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        n_results: usize,
    ) -> Result<Vec<Neighbor>, RagError> {
        let id = self.collection_id(collection).await?;
        let body = json!({
            "query_embeddings": [embedding],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        let resp: QueryResponse = self
            .call(Method::POST, &format!("/collections/{id}/query"), Some(body), collection)
            .await?;
        resp.into_neighbors()
    }

    async fn count(&self, collection: &str) -> Result<usize, RagError> {
        let id = self.collection_id(collection).await?;
        self.call(Method::GET, &format!("/collections/{id}/count"), None, collection)
            .await
    }

    fn name(&self) -> &str {
        "chroma"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_flattens_first_query() {
        let raw = json!({
            "ids": [["a", "b"]],
            "documents": [["first", null]],
            "metadatas": [[{"source": "x.txt"}, null]],
            "distances": [[0.1, 0.7]],
        });
        let resp: QueryResponse = serde_json::from_value(raw).unwrap();
        let hits = resp.into_neighbors().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document, "first");
        assert_eq!(hits[0].metadata["source"], "x.txt");
        assert_eq!(hits[1].document, "");
        assert!((hits[1].distance - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_query_response_length_mismatch() {
        let resp: QueryResponse =
            serde_json::from_value(json!({"ids": [["a"]], "distances": [[]]})).unwrap();
        assert!(matches!(resp.into_neighbors(), Err(RagError::Decode(_))));
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_failure(500, "Collection docs does not exist.".into(), "docs"),
            RagError::CollectionNotFound(_)
        ));
        assert!(matches!(
            classify_failure(500, "Collection docs already exists".into(), "docs"),
            RagError::CollectionExists(_)
        ));
        assert!(matches!(
            classify_failure(500, "boom".into(), "docs"),
            RagError::Store { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_chroma() {
        let index = ChromaIndex::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = index.list_collections().await.unwrap_err();
        assert!(matches!(err, RagError::Connection(_) | RagError::Timeout(_)));
    }
}
