use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::retention::Retention;
use super::state::{resume_from, PipelineState, Stage, StageFailure, TransitionError};
use crate::blob::{BlobStore, FsBlobStore};
use crate::config::PipelineConfig;
use crate::embedding::{
    embed_fragments, Embedder, EmbeddingError, HashEmbedder, HttpEmbedder, SearchHit,
    SqliteVectorStore, VectorStore,
};
use crate::evidence::{EvidenceFragment, EvidenceItem, ValidationStatus};
use crate::graph::{
    GraphError, GraphKeys, GraphStore, GraphWriteError, KnowledgeGraphBuilder, SqliteGraphStore,
};
use crate::ingest::{
    extract_fragments, DocumentFormat, EntityResolver, Extractor, GateError, GateOutcome,
    HttpExtractor, ParseError, ParserRegistry, Resolution, RuleBasedExtractor, Upload,
    ValidationError, ValidationGate,
};
use crate::lineage::{AuditAction, AuditEntry, LineageRecord, LineageRecorder};
use crate::storage::Storage;

/// Why a stage could not commit.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Graph plan rejected: {0}")]
    GraphPlan(#[from] GraphError),
    #[error(transparent)]
    GraphWrite(#[from] GraphWriteError),
    #[error("Vector store error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Stage task aborted: {0}")]
    Aborted(String),
}

impl From<tokio::task::JoinError> for StageError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Aborted(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{stage} failed for evidence {evidence_id}: {source}")]
    Stage {
        evidence_id: Uuid,
        stage: Stage,
        #[source]
        source: StageError,
    },
    #[error("Evidence not found: {0}")]
    NotFound(Uuid),
    #[error("Storage error: {0}")]
    Storage(#[source] crate::Error),
    #[error("Graph store error: {0}")]
    Graph(#[source] GraphError),
    #[error("Embedding error: {0}")]
    Embedding(#[source] EmbeddingError),
    #[error("Pipeline setup failed: {0}")]
    Setup(String),
}

pub type IngestResult<T> = Result<T, IngestError>;

impl From<crate::Error> for IngestError {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::EvidenceNotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl From<GateError> for IngestError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Validation(v) => Self::Validation(v),
            GateError::Read(io) => Self::Storage(crate::Error::Io(io)),
            GateError::Storage(s) => s.into(),
        }
    }
}

impl IngestError {
    /// Whether resubmitting the same request can succeed. Validation and
    /// parse failures need a different file.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::Setup(_) => false,
            Self::Stage { source, .. } => !matches!(source, StageError::Parse(_)),
            Self::Storage(_) | Self::Graph(_) | Self::Embedding(_) => true,
        }
    }

    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Message safe to show the uploader. Infrastructure detail stays in
    /// the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Stage {
                source: StageError::Parse(e),
                ..
            } => format!("The file could not be parsed: {e}"),
            Self::NotFound(id) => format!("Evidence {id} not found"),
            Self::Setup(_) => "The pipeline is not available".to_string(),
            Self::Stage { .. } | Self::Storage(_) | Self::Graph(_) | Self::Embedding(_) => {
                "Processing incomplete, please retry".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Completed,
    Duplicate,
}

impl IngestStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub evidence_id: Uuid,
    pub status: IngestStatus,
    pub fragment_count: usize,
    pub entity_count: usize,
    pub node_count: usize,
    pub relationship_count: usize,
    pub embedding_count: usize,
    pub duplicate_of: Option<Uuid>,
    pub extraction_failures: usize,
    pub embedding_failures: usize,
    pub duplicate_candidates: usize,
    pub duration_ms: u64,
}

impl IngestSummary {
    fn from_item(item: &EvidenceItem, status: IngestStatus, started: Instant) -> Self {
        Self {
            evidence_id: item.id,
            status,
            fragment_count: item.counts.fragments,
            entity_count: item.counts.entities,
            node_count: item.counts.nodes,
            relationship_count: item.counts.relationships,
            embedding_count: item.counts.embeddings,
            duplicate_of: item.duplicate_of,
            extraction_failures: item.counts.extraction_failures,
            embedding_failures: item.counts.embedding_failures,
            duplicate_candidates: item.counts.duplicate_candidates,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Drives one evidence item through every stage in order. Cheap to clone;
/// all collaborators are shared.
#[derive(Clone)]
pub struct IngestPipeline {
    config: PipelineConfig,
    storage: Storage,
    blobs: Arc<dyn BlobStore>,
    gate: ValidationGate,
    parsers: Arc<ParserRegistry>,
    extractor: Arc<dyn Extractor>,
    resolver: Arc<EntityResolver>,
    graph: KnowledgeGraphBuilder,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    recorder: LineageRecorder,
}

impl IngestPipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        storage: Storage,
        blobs: Arc<dyn BlobStore>,
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            gate: ValidationGate::new(storage.clone(), Arc::clone(&blobs), config.max_upload_bytes),
            graph: KnowledgeGraphBuilder::new(graph)
                .with_retries(config.graph_batch_retries)
                .with_backoff(config.retry_backoff()),
            recorder: LineageRecorder::new(storage.clone()),
            parsers: Arc::new(ParserRegistry::default()),
            extractor: Arc::new(RuleBasedExtractor::default()),
            resolver: Arc::new(EntityResolver::new()),
            embedder: Arc::new(HashEmbedder::new()),
            config,
            storage,
            blobs,
            vectors,
        }
    }

    /// Opens the SQLite database and blob directory named by `config`, and
    /// the remote collaborators it points at.
    pub async fn open(config: PipelineConfig) -> IngestResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| IngestError::Storage(e.into()))?;

        let storage = Storage::connect(&config.database_url()).await?;
        let blobs = FsBlobStore::open(config.blob_root()).await?;
        let graph = SqliteGraphStore::new(storage.pool().clone())
            .await
            .map_err(|e| IngestError::Setup(e.to_string()))?;
        let vectors = SqliteVectorStore::new(storage.pool().clone())
            .await
            .map_err(|e| IngestError::Setup(e.to_string()))?;

        let mut pipeline = Self::new(
            config.clone(),
            storage,
            Arc::new(blobs),
            Arc::new(graph),
            Arc::new(vectors),
        );
        if let Some(url) = &config.extraction_url {
            let extractor = HttpExtractor::new(url, config.extraction_timeout())
                .map_err(|e| IngestError::Setup(e.to_string()))?;
            pipeline = pipeline.with_extractor(Arc::new(extractor));
        }
        if let Some(url) = &config.embedding_url {
            let embedder = HttpEmbedder::new(url, config.embedding_timeout())
                .map_err(|e| IngestError::Setup(e.to_string()))?;
            pipeline = pipeline.with_embedder(Arc::new(embedder));
        }
        Ok(pipeline)
    }

    #[must_use]
    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = Arc::new(parsers);
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn graph_store(&self) -> &Arc<dyn GraphStore> {
        self.graph.store()
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub const fn recorder(&self) -> &LineageRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn retention(&self) -> Retention {
        Retention::new(
            self.storage.clone(),
            Arc::clone(&self.blobs),
            Arc::clone(self.graph.store()),
            Arc::clone(&self.vectors),
        )
    }

    pub async fn ingest(&self, upload: &Upload, bytes: &[u8]) -> IngestResult<IngestSummary> {
        self.ingest_reader(upload, bytes, Some(bytes.len() as u64)).await
    }

    /// Streams an upload through the gate, then processes it to completion
    /// unless it duplicates earlier evidence.
    pub async fn ingest_reader<R>(
        &self,
        upload: &Upload,
        reader: R,
        size_hint: Option<u64>,
    ) -> IngestResult<IngestSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let outcome = match self.gate.admit(upload, reader, size_hint).await {
            Ok(outcome) => outcome,
            Err(GateError::Validation(e)) => {
                tracing::info!(file_name = %upload.file_name, "Rejected upload: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        match outcome {
            GateOutcome::Duplicate { item, original } => {
                let entry = AuditEntry::for_item(&item, AuditAction::EvidenceDuplicate)
                    .with_detail("duplicate_of", original.id.to_string());
                self.recorder.record(&entry).await?;
                Ok(IngestSummary::from_item(&item, IngestStatus::Duplicate, started))
            }
            GateOutcome::Stored(item) => {
                let mut entry = AuditEntry::for_item(&item, AuditAction::EvidenceUploaded)
                    .with_detail("size_bytes", item.size_bytes)
                    .with_detail("format", item.detected_format.clone())
                    .with_detail("classification", item.classification.as_str());
                if let Some(batch_id) = upload.batch_id {
                    entry = entry.with_detail("batch_id", batch_id.to_string());
                }
                self.recorder.record(&entry).await?;
                self.run(item, upload.batch_id, AuditAction::EvidenceProcessed, started)
                    .await
            }
        }
    }

    /// Re-enters a stored item at the first stage after its last committed
    /// one. Completed items are rebuilt from their stored fragments.
    pub async fn reprocess(&self, evidence_id: Uuid) -> IngestResult<IngestSummary> {
        let started = Instant::now();
        let item = self.storage.get_evidence(evidence_id).await?;

        let Some(next) = resume_from(item.stage) else {
            return Ok(IngestSummary::from_item(&item, IngestStatus::Duplicate, started));
        };
        tracing::info!(evidence_id = %item.id, from = %next, "Reprocessing evidence");

        let batch_id = self
            .recorder
            .lineage(evidence_id)
            .await?
            .last()
            .and_then(|record| record.batch_id);
        self.run(item, batch_id, AuditAction::EvidenceReprocessed, started)
            .await
    }

    /// Runs [`Self::ingest`] as a background task.
    pub fn spawn_ingest(
        &self,
        upload: Upload,
        bytes: Vec<u8>,
    ) -> JoinHandle<IngestResult<IngestSummary>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.ingest(&upload, &bytes).await })
    }

    pub async fn status(&self, evidence_id: Uuid) -> IngestResult<EvidenceItem> {
        Ok(self.storage.get_evidence(evidence_id).await?)
    }

    /// Fragments of one engagement ranked by similarity to `query`.
    pub async fn search(
        &self,
        engagement_id: Uuid,
        query: &str,
        top_k: usize,
    ) -> IngestResult<Vec<SearchHit>> {
        let timeout = self.config.embedding_timeout();
        let vector = match tokio::time::timeout(timeout, self.embedder.embed(query)).await {
            Ok(result) => result.map_err(IngestError::Embedding)?,
            Err(_) => return Err(IngestError::Embedding(EmbeddingError::Timeout(timeout))),
        };
        self.vectors
            .search(engagement_id, &vector, top_k)
            .await
            .map_err(IngestError::Embedding)
    }

    async fn run(
        &self,
        mut item: EvidenceItem,
        batch_id: Option<Uuid>,
        action: AuditAction,
        started: Instant,
    ) -> IngestResult<IngestSummary> {
        if item.stage == Stage::Completed {
            item.stage = Stage::Parsed;
        }
        item.failure = None;
        let mut state = PipelineState::at(item.stage);

        match self.run_stages(&mut item, &mut state, batch_id, action).await {
            Ok(()) => {
                let summary = IngestSummary::from_item(&item, IngestStatus::Completed, started);
                tracing::info!(
                    evidence_id = %item.id,
                    fragments = summary.fragment_count,
                    entities = summary.entity_count,
                    nodes = summary.node_count,
                    relationships = summary.relationship_count,
                    embeddings = summary.embedding_count,
                    extraction_failures = summary.extraction_failures,
                    embedding_failures = summary.embedding_failures,
                    duration_ms = summary.duration_ms,
                    "Evidence processed"
                );
                Ok(summary)
            }
            Err(source) => Err(self.fail(item, &mut state, source).await),
        }
    }

    async fn run_stages(
        &self,
        item: &mut EvidenceItem,
        state: &mut PipelineState,
        batch_id: Option<Uuid>,
        action: AuditAction,
    ) -> Result<(), StageError> {
        let fragments = if item.stage < Stage::Parsed {
            let fragments = self.parse(item).await?;
            item.validation_status = ValidationStatus::Valid;
            self.commit(item, state, Stage::Parsed).await?;
            fragments
        } else {
            self.storage.list_fragments(item.id).await?
        };

        let mut graph_keys = item.graph_keys.clone().unwrap_or_default();
        if item.stage < Stage::GraphWritten {
            let resolution = self.extract(item, &fragments).await;
            state.advance(Stage::Extracted)?;

            let plan = self.graph.plan(item, &resolution.entities)?;
            let builder = self.graph.clone();
            let keys =
                detached(async move { Ok::<_, StageError>(builder.write(&plan).await?) }).await?;

            self.drop_stale_keys(item, &keys).await;
            item.counts.nodes = keys.nodes.len();
            item.counts.relationships = keys.relationships.len();
            item.graph_keys = Some(keys.clone());
            self.commit(item, state, Stage::GraphWritten).await?;
            graph_keys = keys;
        }

        let embedded = if item.stage < Stage::EmbeddingsWritten {
            let run = embed_fragments(
                Arc::clone(&self.embedder),
                &fragments,
                self.config.embedding_concurrency,
                self.config.embedding_timeout(),
            )
            .await;

            let vectors = Arc::clone(&self.vectors);
            let (engagement_id, evidence_id) = (item.engagement_id, item.id);
            let batch = run.vectors.clone();
            detached(async move {
                Ok::<_, StageError>(vectors.upsert_batch(engagement_id, evidence_id, &batch).await?)
            })
            .await?;

            item.counts.embeddings = run.embedded_count();
            item.counts.embedding_failures = run.failures();
            self.commit(item, state, Stage::EmbeddingsWritten).await?;
            run.embedded_ids()
        } else {
            self.vectors.embedded_fragments(item.id).await?
        };

        let mut snapshot = item.clone();
        snapshot.stage = Stage::Completed;
        let lineage = LineageRecord::new(
            &snapshot,
            batch_id,
            graph_keys.nodes,
            graph_keys.relationships,
            embedded,
        );
        let recorder = self.recorder.clone();
        detached(async move {
            Ok::<_, StageError>(recorder.record_completion(&snapshot, &lineage, action).await?)
        })
        .await?;

        state.advance(Stage::Completed)?;
        item.stage = Stage::Completed;
        Ok(())
    }

    async fn parse(&self, item: &mut EvidenceItem) -> Result<Vec<EvidenceFragment>, StageError> {
        let handle = item
            .storage
            .clone()
            .ok_or_else(|| crate::Error::BlobNotFound(item.id.to_string()))?;
        let data = self.blobs.read(&handle).await?;
        let format: DocumentFormat = item.detected_format.parse()?;

        let drafts = self.parsers.parse(&data, format).await?;
        let fragments: Vec<EvidenceFragment> = drafts
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| {
                EvidenceFragment::from_draft(
                    item.id,
                    u32::try_from(ordinal).unwrap_or(u32::MAX),
                    draft,
                )
            })
            .collect();

        let storage = self.storage.clone();
        let evidence_id = item.id;
        let rows = fragments.clone();
        detached(async move {
            Ok::<_, StageError>(storage.replace_fragments(evidence_id, &rows).await?)
        })
        .await?;

        item.counts.fragments = fragments.len();
        tracing::debug!(
            evidence_id = %item.id,
            format = %format,
            fragments = fragments.len(),
            "Parsed evidence"
        );
        Ok(fragments)
    }

    async fn extract(&self, item: &mut EvidenceItem, fragments: &[EvidenceFragment]) -> Resolution {
        let run = extract_fragments(
            Arc::clone(&self.extractor),
            fragments,
            self.config.extraction_concurrency,
            self.config.extraction_timeout(),
        )
        .await;
        let resolution = self.resolver.resolve(item.id, &run.entities);

        item.counts.entities = resolution.entity_count();
        item.counts.extraction_failures = run.failures();
        item.counts.duplicate_candidates = resolution.duplicate_candidates.len();
        if !resolution.duplicate_candidates.is_empty() {
            tracing::info!(
                evidence_id = %item.id,
                candidates = resolution.duplicate_candidates.len(),
                "Possible duplicate entities left for review"
            );
        }
        resolution
    }

    /// Removes graph artifacts a previous run wrote that this run no longer
    /// produces.
    async fn drop_stale_keys(&self, item: &EvidenceItem, keys: &GraphKeys) {
        let Some(previous) = &item.graph_keys else {
            return;
        };
        let current_nodes: HashSet<&String> = keys.nodes.iter().collect();
        let current_rels: HashSet<&String> = keys.relationships.iter().collect();
        let stale_nodes: Vec<String> = previous
            .nodes
            .iter()
            .filter(|k| !current_nodes.contains(k))
            .cloned()
            .collect();
        let stale_rels: Vec<String> = previous
            .relationships
            .iter()
            .filter(|k| !current_rels.contains(k))
            .cloned()
            .collect();
        if stale_nodes.is_empty() && stale_rels.is_empty() {
            return;
        }

        if let Err(e) = self
            .graph
            .store()
            .delete_keys(item.engagement_id, &stale_nodes, &stale_rels)
            .await
        {
            tracing::warn!(evidence_id = %item.id, "Failed to remove stale graph keys: {}", e);
        }
    }

    /// Persists `item` at `stage`. The in-memory item and state only move
    /// once the write has landed.
    async fn commit(
        &self,
        item: &mut EvidenceItem,
        state: &mut PipelineState,
        stage: Stage,
    ) -> Result<(), StageError> {
        let mut snapshot = item.clone();
        snapshot.stage = stage;
        let storage = self.storage.clone();
        detached(async move {
            storage.save_progress(&snapshot).await?;
            Ok::<_, StageError>(())
        })
        .await?;

        state.advance(stage)?;
        item.stage = stage;
        tracing::debug!(evidence_id = %item.id, stage = %stage, "Stage committed");
        Ok(())
    }

    async fn fail(
        &self,
        mut item: EvidenceItem,
        state: &mut PipelineState,
        source: StageError,
    ) -> IngestError {
        let reason = source.to_string();
        let failure = state.fail(reason.clone()).unwrap_or_else(|_| StageFailure {
            stage: item.stage,
            reason,
        });
        tracing::warn!(
            evidence_id = %item.id,
            stage = %failure.stage,
            "Ingestion failed: {}",
            source
        );

        if matches!(source, StageError::Parse(_)) {
            item.validation_status = ValidationStatus::Rejected;
        }
        item.failure = Some(failure.clone());
        if let Err(e) = self.storage.save_progress(&item).await {
            tracing::warn!(evidence_id = %item.id, "Failed to record stage failure: {}", e);
        }

        let entry = AuditEntry::for_item(&item, AuditAction::EvidenceFailed)
            .with_detail("stage", failure.stage.as_str())
            .with_detail("reason", failure.reason.clone());
        if let Err(e) = self.recorder.record(&entry).await {
            tracing::warn!(evidence_id = %item.id, "Failed to audit stage failure: {}", e);
        }

        IngestError::Stage {
            evidence_id: item.id,
            stage: failure.stage,
            source,
        }
    }
}

/// Runs a store write on its own task so that dropping the caller's future
/// cannot interrupt it halfway.
async fn detached<T, F>(write: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(write).await?
}
