pub mod memory;
pub mod qdrant;

pub use memory::{InMemoryBackend, InMemoryIndex};
pub use qdrant::{QdrantBackend, QdrantIndex};
