use crate::embeddings::{embed_in_batches, Embedder};
use crate::error::QaError;
use crate::models::Chunk;
use crate::store::IndexEntry;
use crate::traits::{IndexBackend, VectorIndex};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A fully built index. Handles are only ever created complete.
pub struct IndexHandle {
    pub id: Uuid,
    pub built_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub dimensions: usize,
    index: Box<dyn VectorIndex>,
}

impl IndexHandle {
    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }
}

impl fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexHandle")
            .field("id", &self.id)
            .field("built_at", &self.built_at)
            .field("chunk_count", &self.chunk_count)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn IndexBackend>,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn IndexBackend>,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            backend,
            batch_size: batch_size.max(1),
        }
    }

    /// Embeds every chunk, then fills a brand new index. Nothing is created
    /// on the backend until all vectors are present and well formed.
    pub async fn build(&self, chunks: Vec<Chunk>) -> Result<IndexHandle, QaError> {
        let dimensions = self.embedder.dimensions();
        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let vectors = embed_in_batches(self.embedder.as_ref(), &texts, self.batch_size).await?;
        debug!(chunks = vectors.len(), "embedded chunks");

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();

        let index = self.backend.create(dimensions).await?;
        if let Err(error) = index.upsert(&entries).await {
            if let Err(cleanup) = index.discard().await {
                tracing::warn!(error = %cleanup, "failed to discard partial index");
            }
            return Err(error.into());
        }

        let handle = IndexHandle {
            id: Uuid::new_v4(),
            built_at: Utc::now(),
            chunk_count: entries.len(),
            dimensions,
            index,
        };
        info!(
            index_id = %handle.id,
            backend = self.backend.name(),
            chunk_count = handle.chunk_count,
            "built index"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::EmbeddingError;
    use crate::stores::InMemoryBackend;
    use async_trait::async_trait;

    fn chunk(index: u64, text: &str) -> Chunk {
        Chunk {
            chunk_id: format!("chunk-{index}"),
            document_name: "doc.pdf".to_string(),
            page_number: 1,
            chunk_index: index,
            start_char: 0,
            text: text.to_string(),
        }
    }

    struct ShortVectorEmbedder;

    #[async_trait]
    impl Embedder for ShortVectorEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn build_indexes_every_chunk_across_batches() {
        let indexer = Indexer::new(
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(InMemoryBackend),
            2,
        );
        let chunks = (0..5).map(|index| chunk(index, "pumps and valves")).collect();

        let handle = indexer.build(chunks).await.expect("build should succeed");
        assert_eq!(handle.chunk_count, 5);
        assert_eq!(handle.index().len().await.unwrap(), 5);
        assert_eq!(handle.dimensions, 128);
    }

    #[tokio::test]
    async fn malformed_vectors_fail_with_embedding_error() {
        let indexer = Indexer::new(Arc::new(ShortVectorEmbedder), Arc::new(InMemoryBackend), 8);
        let result = indexer.build(vec![chunk(0, "text")]).await;
        assert!(matches!(
            result,
            Err(QaError::Embedding(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 2
            }))
        ));
    }
}
