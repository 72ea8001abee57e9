use crate::models::Chunk;
use crate::store::{IndexEntry, IndexHit};
use crate::traits::{IndexBackend, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Creates one Qdrant collection per index build.
pub struct QdrantBackend {
    endpoint: String,
    collection_prefix: String,
    client: Client,
}

impl QdrantBackend {
    pub fn new(endpoint: impl Into<String>, collection_prefix: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection_prefix: collection_prefix.into(),
            client: Client::new(),
        }
    }

    /// Bounds every request made by this backend and the indexes it creates.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SearchError> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }
}

#[async_trait]
impl IndexBackend for QdrantBackend {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn create(&self, dimensions: usize) -> Result<Box<dyn VectorIndex>, SearchError> {
        let collection = format!("{}_{}", self.collection_prefix, Uuid::new_v4().simple());

        let response = self
            .client
            .put(format!("{}/collections/{}", self.endpoint, collection))
            .json(&json!({
                "vectors": { "size": dimensions, "distance": "Cosine" },
            }))
            .send()
            .await?;
        ensure_success(response).await?;

        debug!(collection = %collection, dimensions, "created qdrant collection");
        Ok(Box::new(QdrantIndex {
            endpoint: self.endpoint.clone(),
            collection,
            client: self.client.clone(),
            vector_size: dimensions,
        }))
    }
}

pub struct QdrantIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantIndex {
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

async fn ensure_success(response: Response) -> Result<Response, SearchError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(SearchError::BackendResponse {
        backend: "qdrant".to_string(),
        details: format!("{status}: {body}"),
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError> {
        let points = entries
            .iter()
            .map(|entry| {
                if entry.vector.len() != self.vector_size {
                    return Err(SearchError::Request(format!(
                        "embedding dimension {} != {}",
                        entry.vector.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": entry.chunk.chunk_index,
                    "vector": entry.vector,
                    "payload": serde_json::to_value(&entry.chunk)?,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        ensure_success(response).await?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, SearchError> {
        if vector.len() != self.vector_size {
            return Err(SearchError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
                "with_vector": true,
            }))
            .send()
            .await?;
        let parsed: Value = ensure_success(response).await?.json().await?;

        parse_search_hits(&parsed)
    }

    async fn len(&self) -> Result<usize, SearchError> {
        let response = self
            .client
            .get(format!("{}/collections/{}", self.endpoint, self.collection))
            .send()
            .await?;
        let parsed: Value = ensure_success(response).await?.json().await?;

        Ok(parsed
            .pointer("/result/points_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn discard(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(format!("{}/collections/{}", self.endpoint, self.collection))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn parse_search_hits(parsed: &Value) -> Result<Vec<IndexHit>, SearchError> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "qdrant".to_string(),
            details: "search response has no result array".to_string(),
        })?;

    hits.iter()
        .map(|hit| {
            let payload = hit.pointer("/payload").cloned().unwrap_or(Value::Null);
            let chunk: Chunk = serde_json::from_value(payload)?;
            let vector = hit
                .pointer("/vector")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_f64)
                        .map(|value| value as f32)
                        .collect()
                })
                .unwrap_or_default();
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;

            Ok(IndexHit {
                chunk,
                vector,
                score,
            })
        })
        .collect()
}
