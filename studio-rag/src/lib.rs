//! # Studio RAG
//!
//! Retrieval and the grounding gate. Documents are chunked, embedded and
//! stored through the [`VectorGateway`]; a question is answered only when
//! retrieval finds close enough context and the model's reply survives the
//! [`ResponseValidator`]. Anything else becomes a standard refusal.

pub mod api;
pub mod chroma;
pub mod chunking;
pub mod corpus;
pub mod embeddings;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod refusal;
pub mod retrieval;
pub mod validator;
pub mod vector;

pub use chroma::ChromaIndex;
pub use chunking::{ChunkStrategy, DocumentChunk, chunk_document, chunk_text};
pub use embeddings::{Embedder, EmbedderRegistry, LocalEmbedder, OllamaEmbedder, ZeroEmbedder, cosine_similarity};
pub use error::RagError;
pub use gateway::{GatewaySettings, IngestReport, MAX_BATCH, QueryOptions, VectorGateway};
pub use pipeline::{AnswerGenerator, AnswerRequest, GroundedAnswer, RagPipeline};
pub use refusal::{is_refusal, refusal_message};
pub use retrieval::{ConfidenceLevel, RetrievalResult, RetrievedDocument, apply_threshold, classify};
pub use validator::{FactMarker, RejectReason, ResponseValidator, Validation};
pub use vector::{CollectionInfo, InMemoryIndex, Metadata, Neighbor, VectorIndex, VectorRecord};
