pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod retriever;
pub mod session;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{split_fixed_window, split_sentences, Chunker, WORD_BOUNDARY_TOLERANCE};
pub use config::{Breakpoint, ChunkingConfig, QaConfig, RetrievalOptions, SplitPolicy};
pub use embeddings::{
    cosine_similarity, embed_in_batches, CharacterNgramEmbedder, Embedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ChunkError, EmbeddingError, GenerationError, LoadError, QaError, SearchError};
pub use extractor::{discover_pdf_files, load_documents, LopdfExtractor, PdfExtractor};
pub use generation::{
    build_prompt, AnswerGenerator, AnswerSender, AnswerStream, LanguageModel, OpenAiChatModel,
    StreamEvent, PROMPT_TEMPLATE,
};
pub use indexer::{IndexHandle, Indexer};
pub use models::{
    Chunk, ConversationTurn, Page, RetrievalResult, RetrievedChunk, Role, UploadedPdf,
};
pub use pipeline::{Answer, QaPipeline};
pub use retriever::{maximal_marginal_relevance, Retriever};
pub use session::{AskOutcome, QaSession};
pub use store::{IndexEntry, IndexHit};
pub use stores::{InMemoryBackend, InMemoryIndex, QdrantBackend, QdrantIndex};
pub use traits::{IndexBackend, VectorIndex};
