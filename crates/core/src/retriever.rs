use crate::config::RetrievalOptions;
use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::QaError;
use crate::indexer::IndexHandle;
use crate::models::{RetrievalResult, RetrievedChunk};
use std::sync::Arc;
use tracing::info;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    options: RetrievalOptions,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, options: RetrievalOptions) -> Self {
        Self { embedder, options }
    }

    pub fn options(&self) -> RetrievalOptions {
        self.options
    }

    /// Top `k` chunks for `query` after MMR re-ranking of `fetch_k`
    /// candidates. No index, or an empty one, yields an empty result.
    pub async fn retrieve(
        &self,
        query: &str,
        index: Option<&IndexHandle>,
    ) -> Result<RetrievalResult, QaError> {
        let Some(handle) = index.filter(|handle| !handle.is_empty()) else {
            return Ok(RetrievalResult::empty(query));
        };

        let query_vector = self.embedder.embed(query).await?;
        let fetch_k = self.options.fetch_k.max(self.options.k);
        let candidates = handle.index().query(&query_vector, fetch_k).await?;

        let candidate_count = candidates.len();
        let vectors: Vec<&[f32]> = candidates.iter().map(|hit| hit.vector.as_slice()).collect();
        let selected = maximal_marginal_relevance(
            &query_vector,
            &vectors,
            self.options.k,
            self.options.lambda,
        );

        let mut candidates: Vec<Option<_>> = candidates.into_iter().map(Some).collect();
        let chunks: Vec<RetrievedChunk> = selected
            .into_iter()
            .filter_map(|position| {
                let hit = candidates[position].take()?;
                Some(RetrievedChunk {
                    relevance: cosine_similarity(&query_vector, &hit.vector),
                    chunk: hit.chunk,
                })
            })
            .collect();

        info!(
            candidates = candidate_count,
            returned = chunks.len(),
            "retrieval completed"
        );

        Ok(RetrievalResult {
            query: query.to_string(),
            chunks,
        })
    }
}

/// Positions into `candidates` (which arrive in similarity rank order),
/// chosen greedily by `lambda * relevance - (1 - lambda) * redundancy`.
/// Ties keep the earlier rank.
pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[&[f32]],
    k: usize,
    lambda: f32,
) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let relevance: Vec<f32> = candidates
        .iter()
        .map(|candidate| cosine_similarity(query, candidate))
        .collect();

    let mut selected = Vec::with_capacity(k.min(candidates.len()));
    let mut first = 0;
    for position in 1..candidates.len() {
        if relevance[position] > relevance[first] {
            first = position;
        }
    }
    selected.push(first);

    while selected.len() < k.min(candidates.len()) {
        let mut best: Option<(usize, f32)> = None;
        for position in 0..candidates.len() {
            if selected.contains(&position) {
                continue;
            }
            let redundancy = selected
                .iter()
                .map(|chosen| cosine_similarity(candidates[position], candidates[*chosen]))
                .fold(f32::NEG_INFINITY, f32::max);
            let score = lambda * relevance[position] - (1.0 - lambda) * redundancy;
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((position, score));
            }
        }
        match best {
            Some((position, _)) => selected.push(position),
            None => break,
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::indexer::Indexer;
    use crate::models::Chunk;
    use crate::stores::InMemoryBackend;

    #[test]
    fn single_pick_is_top_relevance_for_any_lambda() {
        let query: [f32; 2] = [1.0, 0.0];
        let a: [f32; 2] = [0.6, 0.8];
        let b: [f32; 2] = [0.9, 0.1];
        let c: [f32; 2] = [0.0, 1.0];
        let candidates: Vec<&[f32]> = vec![&a, &b, &c];
        for lambda in [0.0, 0.3, 0.7, 1.0] {
            assert_eq!(maximal_marginal_relevance(&query, &candidates, 1, lambda), vec![1]);
        }
    }

    #[test]
    fn diversity_skips_near_duplicates() {
        let query: [f32; 2] = [1.0, 0.0];
        let top: [f32; 2] = [1.0, 0.05];
        let duplicate: [f32; 2] = [1.0, 0.06];
        let different: [f32; 2] = [0.8, -0.6];
        let candidates: Vec<&[f32]> = vec![&top, &duplicate, &different];

        assert_eq!(maximal_marginal_relevance(&query, &candidates, 2, 0.5), vec![0, 2]);
        assert_eq!(maximal_marginal_relevance(&query, &candidates, 2, 1.0), vec![0, 1]);
    }

    #[test]
    fn ties_keep_original_rank() {
        let query: [f32; 2] = [1.0, 0.0];
        let same: [f32; 2] = [1.0, 0.0];
        let candidates: Vec<&[f32]> = vec![&same, &same, &same];
        assert_eq!(maximal_marginal_relevance(&query, &candidates, 3, 0.7), vec![0, 1, 2]);
    }

    #[test]
    fn never_returns_more_than_candidates() {
        let query: [f32; 1] = [1.0];
        let only: [f32; 1] = [1.0];
        let candidates: Vec<&[f32]> = vec![&only];
        assert_eq!(maximal_marginal_relevance(&query, &candidates, 5, 0.7), vec![0]);
        assert!(maximal_marginal_relevance(&query, &[], 5, 0.7).is_empty());
    }

    #[tokio::test]
    async fn no_index_yields_empty_result() {
        let retriever = Retriever::new(
            Arc::new(CharacterNgramEmbedder::default()),
            RetrievalOptions::default(),
        );
        let result = retriever.retrieve("anything", None).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.query, "anything");
    }

    #[tokio::test]
    async fn verbatim_substring_ranks_its_chunk_first() {
        let embedder = Arc::new(CharacterNgramEmbedder::default());
        let texts = [
            "Hydraulic pumps must be primed before the first start.",
            "The warranty covers electrical faults for two years.",
            "Replace the air filter every three hundred operating hours.",
        ];
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                chunk_id: format!("chunk-{index}"),
                document_name: "manual.pdf".to_string(),
                page_number: 1,
                chunk_index: index as u64,
                start_char: 0,
                text: text.to_string(),
            })
            .collect();
        let handle = Indexer::new(embedder.clone(), Arc::new(InMemoryBackend), 16)
            .build(chunks)
            .await
            .unwrap();

        let retriever = Retriever::new(embedder, RetrievalOptions::default());
        let result = retriever
            .retrieve("air filter every three hundred", Some(&handle))
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.chunks[0].chunk.chunk_id, "chunk-2");
    }
}
