//! Post-generation checks on a grounded answer.
//!
//! The validator only accepts or rejects; it never rewrites the reply.

use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::RagError;
use crate::refusal::is_refusal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

/// Why a reply was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    LowSimilarity,
    UnsupportedFact,
}

/// A fact-like fragment of the reply with no support in the sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactMarker {
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    pub is_refusal: bool,
    /// Highest reply/source cosine similarity; absent for refusals.
    pub similarity: Option<f32>,
    pub reason: Option<RejectReason>,
    pub markers: Vec<FactMarker>,
}

impl Validation {
    fn refusal() -> Self {
        Self {
            passed: true,
            is_refusal: true,
            similarity: None,
            reason: None,
            markers: Vec::new(),
        }
    }
}

static FACT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("year", r"\b(?:19|20)\d{2}\b"),
        (
            "date",
            r"(?i)\b(?:\d{1,2}/\d{1,2}/\d{2,4}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,\s*\d{4})?)\b",
        ),
        ("amount", r"\$\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:million|billion|trillion|thousand|[mbk]))?"),
        (
            "number_word",
            r"(?i)\b(?:\d+(?:\.\d+)?\s?|(?:(?:one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty|thirty|forty|fifty|sixty|seventy|eighty|ninety|hundred)[\s-]+)+)(?:million|billion|trillion|thousand)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
    .collect()
});

/// Fact-like fragments of `response` whose lowercase form is absent from
/// `sources`.
pub fn unsupported_facts(response: &str, sources: &[String]) -> Vec<FactMarker> {
    let haystack = sources.join("\n").to_lowercase();
    let mut markers: Vec<FactMarker> = Vec::new();
    for (kind, re) in FACT_PATTERNS.iter() {
        for m in re.find_iter(response) {
            let value = m.as_str().trim().to_string();
            if haystack.contains(&value.to_lowercase()) {
                continue;
            }
            if markers.iter().any(|existing| existing.value == value) {
                continue;
            }
            markers.push(FactMarker {
                kind: kind.to_string(),
                value,
            });
        }
    }
    markers
}

pub struct ResponseValidator {
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
    check_facts: bool,
}

impl std::fmt::Debug for ResponseValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseValidator")
            .field("embedder", &self.embedder.name())
            .field("similarity_threshold", &self.similarity_threshold)
            .field("check_facts", &self.check_facts)
            .finish()
    }
}

impl ResponseValidator {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f32, check_facts: bool) -> Self {
        Self {
            embedder,
            similarity_threshold,
            check_facts,
        }
    }

    /// Check `response` against the documents it was grounded on.
    pub async fn validate(&self, response: &str, sources: &[String]) -> Result<Validation, RagError> {
        if is_refusal(response) {
            return Ok(Validation::refusal());
        }

        let similarity = self.max_similarity(response, sources).await?;
        if similarity < self.similarity_threshold {
            return Ok(Validation {
                passed: false,
                is_refusal: false,
                similarity: Some(similarity),
                reason: Some(RejectReason::LowSimilarity),
                markers: Vec::new(),
            });
        }

        let markers = if self.check_facts {
            unsupported_facts(response, sources)
        } else {
            Vec::new()
        };
        let passed = markers.is_empty();
        Ok(Validation {
            passed,
            is_refusal: false,
            similarity: Some(similarity),
            reason: (!passed).then_some(RejectReason::UnsupportedFact),
            markers,
        })
    }

    async fn max_similarity(&self, response: &str, sources: &[String]) -> Result<f32, RagError> {
        if sources.is_empty() {
            return Ok(0.0);
        }
        let mut texts = Vec::with_capacity(sources.len() + 1);
        texts.push(response.to_string());
        texts.extend(sources.iter().cloned());
        let vectors = self.embedder.embed_batch(&texts).await?;
        let Some((reply, docs)) = vectors.split_first() else {
            return Ok(0.0);
        };
        Ok(docs
            .iter()
            .map(|d| cosine_similarity(reply, d))
            .fold(0.0f32, f32::max))
    }
}
