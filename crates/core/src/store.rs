use crate::models::Chunk;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub score: f32,
}
