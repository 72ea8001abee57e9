use crate::store::{IndexEntry, IndexHit};
use crate::SearchError;
use async_trait::async_trait;

/// One searchable collection of embedded chunks.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError>;

    /// Nearest neighbours of `vector`, best first, at most `k`.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, SearchError>;

    async fn len(&self) -> Result<usize, SearchError>;

    /// Releases backend storage once the index is no longer active.
    async fn discard(&self) -> Result<(), SearchError> {
        Ok(())
    }
}

/// Creates a fresh, empty [`VectorIndex`] for every build.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, dimensions: usize) -> Result<Box<dyn VectorIndex>, SearchError>;
}
