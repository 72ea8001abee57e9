use crate::config::{Breakpoint, ChunkingConfig, SplitPolicy, DEFAULT_EMBEDDING_BATCH_SIZE};
use crate::embeddings::{cosine_similarity, embed_in_batches, Embedder};
use crate::error::ChunkError;
use crate::models::{Chunk, Page};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// How far past `chunk_size` a cut may run to land on whitespace.
pub const WORD_BOUNDARY_TOLERANCE: usize = 32;

/// One splitting policy, chosen per ingestion.
pub enum Chunker {
    FixedWindow {
        config: ChunkingConfig,
    },
    Semantic {
        config: ChunkingConfig,
        breakpoint: Breakpoint,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    },
}

impl Chunker {
    pub fn new(
        config: ChunkingConfig,
        policy: SplitPolicy,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, ChunkError> {
        config.validate().map_err(ChunkError::InvalidConfig)?;
        Ok(match policy {
            SplitPolicy::FixedWindow => Self::FixedWindow { config },
            SplitPolicy::Semantic { breakpoint } => Self::Semantic {
                config,
                breakpoint,
                embedder,
                batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            },
        })
    }

    /// Sentences per embedding request in semantic mode.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        if let Self::Semantic { batch_size, .. } = &mut self {
            *batch_size = size.max(1);
        }
        self
    }

    pub fn config(&self) -> ChunkingConfig {
        match self {
            Self::FixedWindow { config } | Self::Semantic { config, .. } => *config,
        }
    }

    pub async fn chunk(&self, pages: &[Page]) -> Result<Vec<Chunk>, ChunkError> {
        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(ChunkError::EmptyText);
        }

        let config = self.config();
        let mut chunks = Vec::new();
        let mut cursor = 0u64;

        for page in pages.iter().filter(|page| !page.text.trim().is_empty()) {
            let chars: Vec<char> = page.text.chars().collect();
            let spans = match self {
                Self::FixedWindow { .. } => split_fixed_window(&chars, config),
                Self::Semantic {
                    breakpoint,
                    embedder,
                    batch_size,
                    ..
                } => {
                    split_semantic(&chars, config, *breakpoint, embedder.as_ref(), *batch_size)
                        .await?
                }
            };

            for span in spans {
                let text: String = chars[span.clone()].iter().collect();
                chunks.push(Chunk {
                    chunk_id: make_chunk_id(&page.document_name, page.number, cursor, &text),
                    document_name: page.document_name.clone(),
                    page_number: page.number,
                    chunk_index: cursor,
                    start_char: span.start,
                    text,
                });
                cursor = cursor.saturating_add(1);
            }
        }

        debug!(pages = pages.len(), chunks = chunks.len(), "chunked pages");
        Ok(chunks)
    }
}

/// Packs `chars` into windows of at most `chunk_size` chars, each window
/// starting at most `overlap` chars before the end of the previous one.
/// The spans cover the input without gaps.
pub fn split_fixed_window(chars: &[char], config: ChunkingConfig) -> Vec<Range<usize>> {
    let total = chars.len();
    let size = config.chunk_size.max(1);
    let overlap = config.overlap.min(size - 1);
    let mut spans = Vec::new();
    let mut start = 0;

    while start < total {
        let window_end = (start + size).min(total);
        if window_end == total {
            spans.push(start..total);
            break;
        }

        let end = find_break(chars, start, window_end, size, overlap)
            .unwrap_or_else(|| extend_to_whitespace(chars, start, window_end, size));
        spans.push(start..end);
        if end == total {
            break;
        }

        let next = end.saturating_sub(overlap).max(start + 1);
        start = align_to_word(chars, next, end);
    }

    spans
}

/// Latest cut inside the window, preferring paragraph, line, sentence,
/// then word boundaries. A cut never lands within `overlap` of `start`.
fn find_break(
    chars: &[char],
    start: usize,
    window_end: usize,
    size: usize,
    overlap: usize,
) -> Option<usize> {
    let earliest = start + overlap + 1;
    let preferred_earliest = earliest.max(start + size / 2);

    let paragraph = |cut: usize| cut >= 2 && chars[cut - 1] == '\n' && chars[cut - 2] == '\n';
    let line = |cut: usize| chars[cut - 1] == '\n';
    let sentence = |cut: usize| {
        cut >= 2 && chars[cut - 1].is_whitespace() && matches!(chars[cut - 2], '.' | '!' | '?')
    };
    let word = |cut: usize| chars[cut - 1].is_whitespace();

    last_cut(preferred_earliest, window_end, paragraph)
        .or_else(|| last_cut(preferred_earliest, window_end, line))
        .or_else(|| last_cut(preferred_earliest, window_end, sentence))
        .or_else(|| last_cut(earliest, window_end, word))
}

fn last_cut(from: usize, to: usize, is_boundary: impl Fn(usize) -> bool) -> Option<usize> {
    (from.max(1)..=to).rev().find(|cut| is_boundary(*cut))
}

fn extend_to_whitespace(chars: &[char], start: usize, window_end: usize, size: usize) -> usize {
    let limit = (start + size + WORD_BOUNDARY_TOLERANCE).min(chars.len());
    if limit == chars.len() {
        return limit;
    }
    (window_end..limit)
        .find(|index| chars[*index].is_whitespace())
        .map(|index| index + 1)
        .unwrap_or(window_end)
}

/// Moves a window start forward to the next word start, staying below `end`.
fn align_to_word(chars: &[char], next: usize, end: usize) -> usize {
    if next == 0 || chars[next - 1].is_whitespace() {
        return next;
    }
    (next..end)
        .find(|index| chars[*index].is_whitespace())
        .map(|index| index + 1)
        .filter(|aligned| *aligned < end)
        .unwrap_or(next)
}

/// Sentence spans covering `chars`; each sentence keeps its trailing whitespace.
pub fn split_sentences(chars: &[char]) -> Result<Vec<Range<usize>>, regex::Error> {
    let sentence_end = Regex::new(r"[.!?]\s+")?;
    let text: String = chars.iter().collect();

    let mut spans = Vec::new();
    let mut start = 0;
    let mut consumed_bytes = 0;
    for found in sentence_end.find_iter(&text) {
        let end = start + text[consumed_bytes..found.end()].chars().count();
        spans.push(start..end);
        start = end;
        consumed_bytes = found.end();
    }

    if start < chars.len() {
        spans.push(start..chars.len());
    }

    Ok(spans)
}

async fn split_semantic(
    chars: &[char],
    config: ChunkingConfig,
    breakpoint: Breakpoint,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<Vec<Range<usize>>, ChunkError> {
    let sentences = split_sentences(chars)?;
    if sentences.len() < 2 {
        return Ok(resplit_oversized(chars, sentences, config));
    }

    let texts: Vec<String> = sentences
        .iter()
        .map(|span| chars[span.clone()].iter().collect::<String>().trim().to_string())
        .collect();
    let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let vectors = embed_in_batches(embedder, &inputs, batch_size).await?;

    let similarities: Vec<f32> = vectors
        .windows(2)
        .map(|pair| cosine_similarity(&pair[0], &pair[1]))
        .collect();
    let breaks = breakpoints(&similarities, breakpoint);

    let mut groups = Vec::new();
    let mut group_start = sentences[0].start;
    for (gap, sentence) in sentences.iter().enumerate().take(sentences.len() - 1) {
        if breaks[gap] {
            groups.push(group_start..sentence.end);
            group_start = sentence.end;
        }
    }
    groups.push(group_start..chars.len());

    Ok(resplit_oversized(chars, groups, config))
}

/// `true` at gap `i` when a new chunk starts after sentence `i`.
pub fn breakpoints(similarities: &[f32], breakpoint: Breakpoint) -> Vec<bool> {
    match breakpoint {
        Breakpoint::Similarity(threshold) => similarities
            .iter()
            .map(|similarity| *similarity < threshold)
            .collect(),
        Breakpoint::Percentile(percentile) => {
            let distances: Vec<f32> = similarities.iter().map(|value| 1.0 - value).collect();
            let threshold = percentile_of(&distances, percentile);
            distances.iter().map(|distance| *distance > threshold).collect()
        }
    }
}

/// Linear-interpolated percentile, `percentile` in 0..=100.
fn percentile_of(values: &[f32], percentile: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (percentile.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn resplit_oversized(
    chars: &[char],
    groups: Vec<Range<usize>>,
    config: ChunkingConfig,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    for group in groups {
        if group.len() <= config.chunk_size {
            spans.push(group);
            continue;
        }
        let offset = group.start;
        spans.extend(
            split_fixed_window(&chars[group], config)
                .into_iter()
                .map(|span| span.start + offset..span.end + offset),
        );
    }
    spans
}

fn make_chunk_id(document_name: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_name.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
