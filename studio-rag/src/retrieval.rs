//! Distance filtering and answerability classification.

use crate::vector::{Metadata, Neighbor};
use serde::{Deserialize, Serialize};

/// Best-distance cut-offs for the confidence levels (cosine distance).
pub const HIGH_CONFIDENCE_MAX: f32 = 0.5;
pub const MEDIUM_CONFIDENCE_MAX: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    Insufficient,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Insufficient => "insufficient",
        }
    }
}

/// A surviving document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub distance: f32,
}

impl From<Neighbor> for RetrievedDocument {
    fn from(n: Neighbor) -> Self {
        Self {
            id: n.id,
            document: n.document,
            metadata: n.metadata,
            distance: n.distance,
        }
    }
}

/// The augmented query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub collection: String,
    pub documents: Vec<RetrievedDocument>,
    /// Neighbours returned before filtering.
    pub raw_count: usize,
    pub filtered_count: usize,
    pub best_distance: Option<f32>,
    pub distance_threshold: f32,
    pub confidence_level: ConfidenceLevel,
    pub is_answerable: bool,
}

/// Confidence for `filtered_count` surviving documents whose nearest is at
/// `best`. No survivors is always insufficient.
pub fn classify(filtered_count: usize, best: Option<f32>, min_documents: usize) -> ConfidenceLevel {
    let Some(best) = best else {
        return ConfidenceLevel::Insufficient;
    };
    if filtered_count == 0 || filtered_count < min_documents {
        ConfidenceLevel::Insufficient
    } else if best <= HIGH_CONFIDENCE_MAX {
        ConfidenceLevel::High
    } else if best <= MEDIUM_CONFIDENCE_MAX {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

/// Drop neighbours farther than `threshold` and classify what remains.
pub fn apply_threshold(
    query: &str,
    collection: &str,
    neighbors: Vec<Neighbor>,
    threshold: f32,
    min_documents: usize,
) -> RetrievalResult {
    let raw_count = neighbors.len();
    let documents: Vec<RetrievedDocument> = neighbors
        .into_iter()
        .filter(|n| n.distance <= threshold)
        .map(RetrievedDocument::from)
        .collect();
    let best_distance = documents
        .iter()
        .map(|d| d.distance)
        .min_by(f32::total_cmp);
    let confidence_level = classify(documents.len(), best_distance, min_documents);
    RetrievalResult {
        query: query.to_string(),
        collection: collection.to_string(),
        filtered_count: documents.len(),
        documents,
        raw_count,
        best_distance,
        distance_threshold: threshold,
        confidence_level,
        is_answerable: confidence_level != ConfidenceLevel::Insufficient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, distance: f32) -> Neighbor {
        Neighbor {
            id: id.into(),
            document: format!("doc {id}"),
            metadata: Metadata::new(),
            distance,
        }
    }

    #[test]
    fn test_confidence_bands() {
        assert_eq!(classify(1, Some(0.2), 0), ConfidenceLevel::High);
        assert_eq!(classify(1, Some(0.5), 0), ConfidenceLevel::High);
        assert_eq!(classify(1, Some(0.51), 0), ConfidenceLevel::Medium);
        assert_eq!(classify(1, Some(0.8), 0), ConfidenceLevel::Medium);
        assert_eq!(classify(1, Some(0.95), 0), ConfidenceLevel::Low);
        assert_eq!(classify(2, Some(0.1), 3), ConfidenceLevel::Insufficient);
        assert_eq!(classify(0, None, 0), ConfidenceLevel::Insufficient);
    }

    #[test]
    fn test_threshold_drops_far_results() {
        let result = apply_threshold(
            "who won the 1812 election?",
            "history",
            vec![hit("a", 1.1), hit("b", 1.3)],
            0.8,
            0,
        );
        assert_eq!(result.raw_count, 2);
        assert_eq!(result.filtered_count, 0);
        assert_eq!(result.best_distance, None);
        assert_eq!(result.confidence_level, ConfidenceLevel::Insufficient);
        assert!(!result.is_answerable);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let result = apply_threshold("q", "c", vec![hit("a", 0.3), hit("b", 0.8), hit("c", 0.81)], 0.8, 0);
        assert_eq!(result.filtered_count, 2);
        assert_eq!(result.best_distance, Some(0.3));
        assert_eq!(result.confidence_level, ConfidenceLevel::High);
        assert!(result.is_answerable);
    }
}
