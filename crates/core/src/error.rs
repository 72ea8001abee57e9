use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no documents were provided")]
    NoDocuments,

    #[error("document is empty: {name}")]
    EmptyInput { name: String },

    #[error("pdf parse error in {name}: {details}")]
    PdfParse { name: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("no text to chunk after trimming")]
    EmptyText,

    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),

    #[error("semantic split failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("{provider} embedding request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} embedding api returned {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("embedding dimension {actual} != {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding count {actual} doesn't match input count {expected}")]
    CountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("language model request failed: {0}")]
    Request(String),

    #[error("language model rate limited: {0}")]
    RateLimited(String),

    #[error("language model rejected credentials: {0}")]
    Auth(String),

    #[error("language model returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("answer stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Error)]
pub enum QaError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("index not ready: ingest documents before asking questions")]
    IndexNotReady,

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
