//! Retrieve, generate, validate: the grounded answer flow.

use crate::gateway::{QueryOptions, VectorGateway};
use crate::refusal::{REFUSAL_INSTRUCTION, refusal_message};
use crate::retrieval::{ConfidenceLevel, RetrievalResult, RetrievedDocument};
use crate::validator::{ResponseValidator, Validation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use studio_core::config::RagConfig;
use studio_core::error::StudioError;
use studio_core::llm::ChatMessage;
use studio_inference::InferenceService;
use tracing::{info, warn};

/// Produces the model reply for a grounded prompt.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        deploy_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, StudioError>;
}

#[async_trait]
impl AnswerGenerator for InferenceService {
    async fn generate(
        &self,
        deploy_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, StudioError> {
        self.complete(deploy_id, messages).await
    }
}

/// Body of `POST /api/v1/rag/collections/{name}/answer`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerRequest {
    pub query: String,
    /// Deployment that generates the reply.
    pub deploy_id: String,
    #[serde(flatten)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedAnswer {
    pub query: String,
    pub answer: String,
    /// True when `answer` is the standard refusal rather than model output.
    pub refused: bool,
    pub is_answerable: bool,
    pub confidence_level: ConfidenceLevel,
    pub filtered_count: usize,
    pub best_distance: Option<f32>,
    pub validation: Option<Validation>,
    pub sources: Vec<RetrievedDocument>,
}

impl GroundedAnswer {
    fn refusal(retrieval: RetrievalResult, validation: Option<Validation>) -> Self {
        Self {
            answer: refusal_message(&retrieval.query),
            query: retrieval.query,
            refused: true,
            is_answerable: retrieval.is_answerable,
            confidence_level: retrieval.confidence_level,
            filtered_count: retrieval.filtered_count,
            best_distance: retrieval.best_distance,
            validation,
            sources: retrieval.documents,
        }
    }
}

/// Prompt that pins the model to the retrieved context.
pub fn grounded_messages(query: &str, documents: &[RetrievedDocument]) -> Vec<ChatMessage> {
    let mut context = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let source = doc
            .metadata
            .get("source")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown");
        let _ = writeln!(context, "[{}] (source: {source})\n{}\n", i + 1, doc.document);
    }
    let system = format!(
        "Answer the question using only the documents below. Do not add facts, dates or \
         figures that the documents do not state. {REFUSAL_INSTRUCTION}\n\nDocuments:\n{context}"
    );
    vec![ChatMessage::system(system), ChatMessage::user(query)]
}

pub struct RagPipeline {
    gateway: VectorGateway,
    generator: Arc<dyn AnswerGenerator>,
    validator: ResponseValidator,
}

impl std::fmt::Debug for RagPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagPipeline")
            .field("gateway", &self.gateway)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

impl RagPipeline {
    pub fn new(
        gateway: VectorGateway,
        generator: Arc<dyn AnswerGenerator>,
        validator: ResponseValidator,
    ) -> Self {
        Self {
            gateway,
            generator,
            validator,
        }
    }

    /// Validator settings come from `config`, embeddings from the gateway.
    pub fn from_config(
        gateway: VectorGateway,
        generator: Arc<dyn AnswerGenerator>,
        config: &RagConfig,
    ) -> Self {
        let validator = ResponseValidator::new(
            Arc::clone(gateway.embedder()),
            config.similarity_threshold,
            config.check_unsupported_facts,
        );
        Self::new(gateway, generator, validator)
    }

    pub fn gateway(&self) -> &VectorGateway {
        &self.gateway
    }

    /// Answer `request.query` from `collection` or refuse.
    pub async fn answer(
        &self,
        collection: &str,
        request: &AnswerRequest,
    ) -> Result<GroundedAnswer, StudioError> {
        let retrieval = self
            .gateway
            .query(collection, &request.query, &request.options)
            .await?;
        if !retrieval.is_answerable {
            info!(
                collection,
                filtered = retrieval.filtered_count,
                best = ?retrieval.best_distance,
                "Refusing: not enough relevant context"
            );
            return Ok(GroundedAnswer::refusal(retrieval, None));
        }

        let messages = grounded_messages(&request.query, &retrieval.documents);
        let reply = self.generator.generate(&request.deploy_id, messages).await?;
        let sources: Vec<String> = retrieval
            .documents
            .iter()
            .map(|d| d.document.clone())
            .collect();
        let validation = self.validator.validate(&reply, &sources).await?;

        if !validation.passed {
            warn!(
                collection,
                reason = ?validation.reason,
                similarity = ?validation.similarity,
                markers = validation.markers.len(),
                "Refusing: reply failed grounding checks"
            );
            return Ok(GroundedAnswer::refusal(retrieval, Some(validation)));
        }

        Ok(GroundedAnswer {
            query: retrieval.query,
            answer: reply,
            refused: false,
            is_answerable: true,
            confidence_level: retrieval.confidence_level,
            filtered_count: retrieval.filtered_count,
            best_distance: retrieval.best_distance,
            validation: Some(validation),
            sources: retrieval.documents,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CannedGenerator;
    use super::*;
    use crate::chunking::ChunkStrategy;
    use crate::embeddings::LocalEmbedder;
    use crate::gateway::GatewaySettings;
    use crate::validator::RejectReason;
    use crate::vector::InMemoryIndex;

    async fn pipeline(reply: &str) -> (RagPipeline, Arc<CannedGenerator>) {
        let gateway = VectorGateway::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(LocalEmbedder::new("local-hash-384", 384)),
            GatewaySettings::default(),
        );
        gateway.create_collection("company").await.unwrap();
        gateway
            .ingest(
                "company",
                "The company expanded its hardware team and shipped new accelerator cards.",
                "history.txt",
                None,
                ChunkStrategy::default(),
            )
            .await
            .unwrap();
        let generator = Arc::new(CannedGenerator::new(reply));
        let pipeline = RagPipeline::from_config(gateway, generator.clone(), &RagConfig::default());
        (pipeline, generator)
    }

    fn ask(query: &str) -> AnswerRequest {
        AnswerRequest {
            query: query.into(),
            deploy_id: "d1".into(),
            options: QueryOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_grounded_reply_is_returned_verbatim() {
        let reply = "The company expanded its hardware team and shipped new accelerator cards.";
        let (p, generator) = pipeline(reply).await;
        let out = p
            .answer("company", &ask("what did the company ship with its hardware team"))
            .await
            .unwrap();
        assert!(!out.refused);
        assert_eq!(out.answer, reply);
        assert_eq!(generator.calls(), 1);
        let prompt = &generator.prompts.lock().unwrap()[0];
        assert!(prompt[0].content.contains("accelerator cards"));
        assert!(prompt[0].content.contains("source: history.txt"));
    }

    #[tokio::test]
    async fn test_insufficient_context_skips_generation() {
        let (p, generator) = pipeline("anything").await;
        let out = p.answer("company", &ask("who won the 1812 election?")).await.unwrap();
        assert!(out.refused);
        assert!(!out.is_answerable);
        assert_eq!(out.confidence_level, ConfidenceLevel::Insufficient);
        assert!(out.answer.contains("who won the 1812 election?"));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_refusal_is_accepted() {
        let (p, _) = pipeline("I cannot answer this based on the provided documents.").await;
        let out = p
            .answer("company", &ask("what accelerator cards did the company ship"))
            .await
            .unwrap();
        assert!(!out.refused);
        assert!(out.validation.as_ref().unwrap().is_refusal);
    }

    #[tokio::test]
    async fn test_off_topic_reply_is_low_similarity() {
        let (p, _) = pipeline("Bananas are rich in potassium.").await;
        let out = p
            .answer("company", &ask("what accelerator cards did the company ship"))
            .await
            .unwrap();
        assert!(out.refused);
        assert_eq!(
            out.validation.unwrap().reason,
            Some(RejectReason::LowSimilarity)
        );
    }
}
