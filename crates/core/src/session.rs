use crate::error::QaError;
use crate::indexer::IndexHandle;
use crate::models::{ConversationTurn, RetrievalResult, Role, UploadedPdf};
use crate::pipeline::QaPipeline;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub answer: String,
    pub evidence: RetrievalResult,
}

/// Caller-owned conversation: the active index and the turn history.
/// Independent sessions can share one [`QaPipeline`].
pub struct QaSession {
    pipeline: Arc<QaPipeline>,
    active: Option<Arc<IndexHandle>>,
    history: Vec<ConversationTurn>,
}

impl QaSession {
    pub fn new(pipeline: Arc<QaPipeline>) -> Self {
        Self {
            pipeline,
            active: None,
            history: Vec::new(),
        }
    }

    pub fn active_index(&self) -> Option<&Arc<IndexHandle>> {
        self.active.as_ref()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Builds a new index and makes it active. On failure the previous
    /// index and history stay exactly as they were.
    pub async fn ingest(&mut self, uploads: &[UploadedPdf]) -> Result<Arc<IndexHandle>, QaError> {
        let handle = self.pipeline.ingest(uploads).await?;
        let previous = self.active.replace(handle.clone());
        self.history.clear();

        if let Some(previous) = previous {
            release(previous).await;
        }

        info!(index_id = %handle.id, "index activated");
        Ok(handle)
    }

    /// Ends the session, discarding the active index unless another holder
    /// still shares it.
    pub async fn close(mut self) {
        if let Some(active) = self.active.take() {
            release(active).await;
        }
    }

    pub async fn retrieve_only(&self, query: &str) -> Result<RetrievalResult, QaError> {
        self.pipeline.retrieve_only(query, self.active.as_deref()).await
    }

    /// Streams the answer through `on_fragment`. Both turns are recorded
    /// only once the stream completes; a failure leaves history untouched.
    pub async fn ask<F>(
        &mut self,
        question: &str,
        mut on_fragment: F,
    ) -> Result<AskOutcome, QaError>
    where
        F: FnMut(&str),
    {
        let mut answer = self.pipeline.ask(question, self.active.as_deref()).await?;

        let mut text = String::new();
        while let Some(fragment) = answer.stream.next_fragment().await {
            let fragment = fragment?;
            on_fragment(&fragment);
            text.push_str(&fragment);
        }

        self.history.push(ConversationTurn::new(Role::User, question));
        self.history.push(ConversationTurn::new(Role::Assistant, text.clone()));

        Ok(AskOutcome {
            answer: text,
            evidence: answer.evidence,
        })
    }
}

async fn release(handle: Arc<IndexHandle>) {
    if Arc::strong_count(&handle) > 1 {
        return;
    }
    match handle.index().discard().await {
        Ok(()) => debug!(index_id = %handle.id, "index discarded"),
        Err(error) => warn!(index_id = %handle.id, error = %error, "failed to discard index"),
    }
}
