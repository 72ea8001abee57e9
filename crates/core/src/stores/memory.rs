use crate::embeddings::cosine_similarity;
use crate::store::{IndexEntry, IndexHit};
use crate::traits::{IndexBackend, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Flat cosine-similarity scan over vectors held in process memory.
#[derive(Debug)]
pub struct InMemoryIndex {
    dimensions: usize,
    entries: RwLock<Vec<IndexEntry>>,
}

impl InMemoryIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError> {
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.vector.len() != self.dimensions)
        {
            return Err(SearchError::Request(format!(
                "embedding dimension {} != {}",
                entry.vector.len(),
                self.dimensions
            )));
        }

        let mut stored = self.entries.write().await;
        for entry in entries {
            match stored
                .iter_mut()
                .find(|existing| existing.chunk.chunk_id == entry.chunk.chunk_id)
            {
                Some(existing) => *existing = entry.clone(),
                None => stored.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, SearchError> {
        if vector.len() != self.dimensions {
            return Err(SearchError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.dimensions
            )));
        }

        let stored = self.entries.read().await;
        let mut hits: Vec<IndexHit> = stored
            .iter()
            .map(|entry| IndexHit {
                chunk: entry.chunk.clone(),
                vector: entry.vector.clone(),
                score: cosine_similarity(&entry.vector, vector),
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize, SearchError> {
        Ok(self.entries.read().await.len())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryBackend;

#[async_trait]
impl IndexBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, dimensions: usize) -> Result<Box<dyn VectorIndex>, SearchError> {
        Ok(Box::new(InMemoryIndex::new(dimensions)))
    }
}
