//! Embedding providers and the process-wide registry.
//!
//! Three providers exist: a local feature-hashing embedder that needs no
//! model files, an Ollama client for real sentence embeddings, and a zero
//! embedder used when embeddings are switched off. The registry hands out
//! one shared instance per model name.

use crate::error::RagError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use studio_core::config::RagConfig;
use tracing::{info, warn};

/// Dimensions used when a local model name carries none.
pub const DEFAULT_LOCAL_DIMENSIONS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| RagError::Embedding("provider returned no vector".into()))
    }

    fn dimensions(&self) -> usize;

    /// Name recorded in collection metadata.
    fn name(&self) -> &str;
}

/// Feature-hashing term-frequency embedder.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    name: String,
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            vector[djb2(term) % self.dimensions] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Returns zero vectors; every similarity against it is 0.
#[derive(Debug, Clone)]
pub struct ZeroEmbedder {
    dimensions: usize,
}

impl ZeroEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl Embedder for ZeroEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(vec![vec![0.0; self.dimensions]; texts.len()])
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Ollama `/api/embed` client.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
    dims: usize,
    timeout_secs: u64,
}

impl OllamaEmbedder {
    pub fn new(model: &str, base_url: &str, timeout: Duration) -> Result<Self, RagError> {
        let dims = match model {
            "nomic-embed-text" => 768,
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Embedding(e.to_string()))?;
        Ok(Self {
            client,
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dims,
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::from_reqwest(e, self.timeout_secs))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!("HTTP {status}: {body}")));
        }
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RagError::from_reqwest(e, self.timeout_secs))?;
        let vectors: Vec<Vec<f32>> = json["embeddings"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|v| v.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        if vectors.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Cosine similarity; zero-length or zero-norm inputs give 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Parse `local-hash-<dims>` model names.
fn local_dimensions(model: &str) -> Option<usize> {
    let rest = model.strip_prefix("local-hash")?;
    if rest.is_empty() {
        return Some(DEFAULT_LOCAL_DIMENSIONS);
    }
    rest.strip_prefix('-')?.parse().ok().filter(|d| *d > 0)
}

/// Lazily built embedders, one per model name.
pub struct EmbedderRegistry {
    enabled: bool,
    remote_url: Option<String>,
    timeout: Duration,
    loaded: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl std::fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderRegistry")
            .field("enabled", &self.enabled)
            .field("remote_url", &self.remote_url)
            .finish_non_exhaustive()
    }
}

impl EmbedderRegistry {
    pub fn new(enabled: bool, remote_url: Option<String>, timeout: Duration) -> Self {
        Self {
            enabled,
            remote_url,
            timeout,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(
            config.embeddings_enabled,
            config.embedding_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Shared embedder for `model`, built on first use.
    pub fn get(&self, model: &str) -> Result<Arc<dyn Embedder>, RagError> {
        if let Some(found) = self
            .loaded
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(model)
        {
            return Ok(Arc::clone(found));
        }

        let mut loaded = self.loaded.write().unwrap_or_else(|p| p.into_inner());
        // another caller may have won the race while we waited
        if let Some(found) = loaded.get(model) {
            return Ok(Arc::clone(found));
        }
        let embedder = self.build(model)?;
        info!(model, provider = embedder.name(), dims = embedder.dimensions(), "Embedder initialized");
        loaded.insert(model.to_string(), Arc::clone(&embedder));
        Ok(embedder)
    }

    fn build(&self, model: &str) -> Result<Arc<dyn Embedder>, RagError> {
        let local = local_dimensions(model);
        if !self.enabled {
            return Ok(Arc::new(ZeroEmbedder::new(
                local.unwrap_or(DEFAULT_LOCAL_DIMENSIONS),
            )));
        }
        if let Some(dims) = local {
            return Ok(Arc::new(LocalEmbedder::new(model, dims)));
        }
        match &self.remote_url {
            Some(url) => Ok(Arc::new(OllamaEmbedder::new(model, url, self.timeout)?)),
            None => {
                warn!(model, "No embedding service configured; using local hashing embedder");
                Ok(Arc::new(LocalEmbedder::new(model, DEFAULT_LOCAL_DIMENSIONS)))
            }
        }
    }
}
