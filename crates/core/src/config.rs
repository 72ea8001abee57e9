use crate::error::QaError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_FETCH_K: usize = 20;
pub const DEFAULT_MMR_LAMBDA: f32 = 0.7;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Where the semantic splitter starts a new chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Breakpoint {
    /// Break when adjacent-sentence similarity falls below this value.
    Similarity(f32),
    /// Break at adjacent-sentence distances above this percentile (0..=100).
    Percentile(f32),
}

impl Default for Breakpoint {
    fn default() -> Self {
        Self::Percentile(95.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum SplitPolicy {
    #[default]
    FixedWindow,
    Semantic { breakpoint: Breakpoint },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub k: usize,
    pub fetch_k: usize,
    pub lambda: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            k: DEFAULT_TOP_K,
            fetch_k: DEFAULT_FETCH_K,
            lambda: DEFAULT_MMR_LAMBDA,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaConfig {
    pub chunking: ChunkingConfig,
    pub split: SplitPolicy,
    pub retrieval: RetrievalOptions,
    pub embedding_batch_size: usize,
    /// Appended to the prompt as "Answer (in <language>)".
    pub answer_language: Option<String>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            split: SplitPolicy::default(),
            retrieval: RetrievalOptions::default(),
            embedding_batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            answer_language: None,
        }
    }
}

impl QaConfig {
    pub fn validate(&self) -> Result<(), QaError> {
        self.chunking.validate().map_err(QaError::InvalidConfig)?;

        if let SplitPolicy::Semantic { breakpoint } = self.split {
            match breakpoint {
                Breakpoint::Similarity(threshold) if !(-1.0..=1.0).contains(&threshold) => {
                    return Err(QaError::InvalidConfig(format!(
                        "similarity breakpoint {threshold} is outside [-1, 1]"
                    )));
                }
                Breakpoint::Percentile(percentile) if !(0.0..=100.0).contains(&percentile) => {
                    return Err(QaError::InvalidConfig(format!(
                        "percentile breakpoint {percentile} is outside [0, 100]"
                    )));
                }
                _ => {}
            }
        }

        let retrieval = &self.retrieval;
        if retrieval.k == 0 {
            return Err(QaError::InvalidConfig("k must be at least 1".to_string()));
        }
        if retrieval.fetch_k < retrieval.k {
            return Err(QaError::InvalidConfig(format!(
                "fetch_k {} is smaller than k {}",
                retrieval.fetch_k, retrieval.k
            )));
        }
        if !(0.0..=1.0).contains(&retrieval.lambda) {
            return Err(QaError::InvalidConfig(format!(
                "lambda {} is outside [0, 1]",
                retrieval.lambda
            )));
        }
        if self.embedding_batch_size == 0 {
            return Err(QaError::InvalidConfig(
                "embedding batch size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk size must be at least 1".to_string());
        }
        if self.overlap >= self.chunk_size {
            return Err(format!(
                "overlap {} must be smaller than chunk size {}",
                self.overlap, self.chunk_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.chunk_size, 1_000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.k, 5);
        assert_eq!(config.retrieval.fetch_k, 20);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = QaConfig {
            chunking: ChunkingConfig {
                chunk_size: 100,
                overlap: 100,
            },
            ..QaConfig::default()
        };
        assert!(matches!(config.validate(), Err(QaError::InvalidConfig(_))));
    }

    #[test]
    fn fetch_k_below_k_is_rejected() {
        let config = QaConfig {
            retrieval: RetrievalOptions {
                k: 10,
                fetch_k: 5,
                lambda: 0.5,
            },
            ..QaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_percentile_is_rejected() {
        let config = QaConfig {
            split: SplitPolicy::Semantic {
                breakpoint: Breakpoint::Percentile(140.0),
            },
            ..QaConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
