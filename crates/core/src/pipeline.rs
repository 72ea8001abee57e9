use crate::chunking::Chunker;
use crate::config::QaConfig;
use crate::embeddings::Embedder;
use crate::error::QaError;
use crate::extractor::{load_documents, PdfExtractor};
use crate::generation::{AnswerGenerator, AnswerStream, LanguageModel};
use crate::indexer::{IndexHandle, Indexer};
use crate::models::{RetrievalResult, UploadedPdf};
use crate::retriever::Retriever;
use crate::traits::IndexBackend;
use std::sync::Arc;
use tracing::info;

/// Evidence plus the streamed answer for one question.
pub struct Answer {
    pub evidence: RetrievalResult,
    pub stream: AnswerStream,
}

/// Stateless composition of the external capabilities. Sessions share it.
pub struct QaPipeline {
    config: QaConfig,
    extractor: Arc<dyn PdfExtractor>,
    embedder: Arc<dyn Embedder>,
    indexer: Indexer,
    retriever: Retriever,
    generator: AnswerGenerator,
}

impl QaPipeline {
    pub fn new(
        config: QaConfig,
        extractor: Arc<dyn PdfExtractor>,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn IndexBackend>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self, QaError> {
        config.validate()?;

        Ok(Self {
            indexer: Indexer::new(embedder.clone(), backend, config.embedding_batch_size),
            retriever: Retriever::new(embedder.clone(), config.retrieval),
            generator: AnswerGenerator::new(model, config.answer_language.clone()),
            extractor,
            embedder,
            config,
        })
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    /// Load, chunk, embed, and index `uploads` into a new index.
    pub async fn ingest(&self, uploads: &[UploadedPdf]) -> Result<Arc<IndexHandle>, QaError> {
        let pages = load_documents(uploads, self.extractor.as_ref())?;
        let chunker = Chunker::new(self.config.chunking, self.config.split, self.embedder.clone())?
            .with_batch_size(self.config.embedding_batch_size);
        let chunks = chunker.chunk(&pages).await?;
        let chunk_count = chunks.len();

        let handle = self.indexer.build(chunks).await?;
        info!(
            documents = uploads.len(),
            pages = pages.len(),
            chunks = chunk_count,
            "ingestion completed"
        );
        Ok(Arc::new(handle))
    }

    pub async fn retrieve_only(
        &self,
        query: &str,
        index: Option<&IndexHandle>,
    ) -> Result<RetrievalResult, QaError> {
        self.retriever.retrieve(query, index).await
    }

    pub async fn ask(&self, query: &str, index: Option<&IndexHandle>) -> Result<Answer, QaError> {
        let index = index.ok_or(QaError::IndexNotReady)?;
        let evidence = self.retriever.retrieve(query, Some(index)).await?;
        let stream = self.generator.generate(query, &evidence).await?;
        Ok(Answer { evidence, stream })
    }
}
