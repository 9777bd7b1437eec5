use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use evidentia_core::embedding::{
    EmbeddingError, EmbeddingResult, FragmentVector, SearchHit, VectorStore,
};
use evidentia_core::evidence::FragmentDraft;
use evidentia_core::graph::{GraphError, GraphNode, GraphRelationship, GraphResult, NodeLabel};
use evidentia_core::ingest::{
    DocumentFormat, ExtractedEntity, ExtractionError, ExtractionResult, ExtractionStrategy,
    Extractor, ParseError, ParseResult, Parser, ParserRegistry, TextParser,
};
use evidentia_core::pipeline::StageError;
use evidentia_core::{
    AuditAction, Embedding, EntityType, FsBlobStore, GraphStore, IngestError, IngestPipeline, IngestStatus,
    MemoryGraphStore, PipelineConfig, RelationType, SqliteVectorStore, Stage, Storage, Upload,
    ValidationError, ValidationStatus,
};

/// Emits one mention for every vocabulary phrase found in a fragment.
/// Fragments containing `FAIL` error out.
struct ScriptedExtractor {
    vocabulary: Vec<(EntityType, String, f64)>,
}

impl ScriptedExtractor {
    fn new(vocabulary: &[(EntityType, &str, f64)]) -> Self {
        Self {
            vocabulary: vocabulary
                .iter()
                .map(|(t, phrase, c)| (*t, (*phrase).to_string(), *c))
                .collect(),
        }
    }

    fn invoice() -> Self {
        Self::new(&[
            (EntityType::Activity, "Invoice Approval", 0.9),
            (EntityType::System, "Finance System", 0.8),
        ])
    }
}

#[async_trait::async_trait]
impl Extractor for ScriptedExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::Scripted
    }

    async fn extract(&self, text: &str, fragment_id: Uuid) -> ExtractionResult<Vec<ExtractedEntity>> {
        if text.contains("FAIL") {
            return Err(ExtractionError::Unavailable("scripted outage".into()));
        }
        Ok(self
            .vocabulary
            .iter()
            .filter(|(_, phrase, _)| text.contains(phrase.as_str()))
            .map(|(t, phrase, c)| ExtractedEntity::new(fragment_id, *t, phrase.clone(), *c))
            .collect())
    }
}

/// Memory graph store whose relationship batches fail while switched off.
struct SwitchableStore {
    inner: MemoryGraphStore,
    reject_relationships: AtomicBool,
}

#[async_trait::async_trait]
impl GraphStore for SwitchableStore {
    async fn upsert_nodes(&self, label: NodeLabel, nodes: &[GraphNode]) -> GraphResult<usize> {
        self.inner.upsert_nodes(label, nodes).await
    }

    async fn upsert_relationships(
        &self,
        relation: RelationType,
        relationships: &[GraphRelationship],
    ) -> GraphResult<usize> {
        if self.reject_relationships.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable("injected outage".into()));
        }
        self.inner.upsert_relationships(relation, relationships).await
    }

    async fn nodes(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphNode>> {
        self.inner.nodes(engagement_id).await
    }

    async fn relationships(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphRelationship>> {
        self.inner.relationships(engagement_id).await
    }

    async fn delete_keys(
        &self,
        engagement_id: Uuid,
        node_keys: &[String],
        relationship_keys: &[String],
    ) -> GraphResult<usize> {
        self.inner
            .delete_keys(engagement_id, node_keys, relationship_keys)
            .await
    }

    async fn delete_evidence(&self, engagement_id: Uuid, evidence_id: Uuid) -> GraphResult<usize> {
        self.inner.delete_evidence(engagement_id, evidence_id).await
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> GraphResult<usize> {
        self.inner.delete_engagement(engagement_id).await
    }
}

/// Vector store whose batch writes fail while switched off.
struct SwitchableVectors {
    inner: SqliteVectorStore,
    reject_writes: AtomicBool,
}

#[async_trait::async_trait]
impl VectorStore for SwitchableVectors {
    async fn upsert_batch(
        &self,
        engagement_id: Uuid,
        evidence_id: Uuid,
        vectors: &[FragmentVector],
    ) -> EmbeddingResult<usize> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("injected outage".into()));
        }
        self.inner.upsert_batch(engagement_id, evidence_id, vectors).await
    }

    async fn search(
        &self,
        engagement_id: Uuid,
        query: &Embedding,
        top_k: usize,
    ) -> EmbeddingResult<Vec<SearchHit>> {
        self.inner.search(engagement_id, query, top_k).await
    }

    async fn embedded_fragments(&self, evidence_id: Uuid) -> EmbeddingResult<Vec<Uuid>> {
        self.inner.embedded_fragments(evidence_id).await
    }

    async fn delete_fragments(&self, fragment_ids: &[Uuid]) -> EmbeddingResult<usize> {
        self.inner.delete_fragments(fragment_ids).await
    }

    async fn delete_evidence(&self, evidence_id: Uuid) -> EmbeddingResult<usize> {
        self.inner.delete_evidence(evidence_id).await
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> EmbeddingResult<usize> {
        self.inner.delete_engagement(engagement_id).await
    }
}

/// Text parser that reports malformed content until switched on.
struct FlakyTextParser {
    broken: AtomicBool,
}

#[async_trait::async_trait]
impl Parser for FlakyTextParser {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::PlainText]
    }

    async fn parse_bytes(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ParseError::Malformed("injected corruption".into()));
        }
        TextParser::new().parse_bytes(data, format).await
    }
}

struct Harness {
    tmp: TempDir,
    storage: Storage,
    pipeline: IngestPipeline,
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default().with_max_upload_bytes(64 * 1024);
    config.retry_backoff_ms = 1;
    config
}

async fn harness(config: PipelineConfig, graph: Arc<dyn GraphStore>) -> Harness {
    harness_with_vectors(config, graph, |vectors| Arc::new(vectors)).await
}

async fn harness_with_vectors(
    config: PipelineConfig,
    graph: Arc<dyn GraphStore>,
    wrap: impl FnOnce(SqliteVectorStore) -> Arc<dyn VectorStore>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open_memory().await.unwrap();
    let blobs = FsBlobStore::open(tmp.path()).await.unwrap();
    let vectors = SqliteVectorStore::new(storage.pool().clone()).await.unwrap();
    let pipeline = IngestPipeline::new(
        config,
        storage.clone(),
        Arc::new(blobs),
        graph,
        wrap(vectors),
    )
    .with_extractor(Arc::new(ScriptedExtractor::invoice()));
    Harness {
        tmp,
        storage,
        pipeline,
    }
}

async fn memory_harness() -> (Harness, Arc<MemoryGraphStore>) {
    let graph = Arc::new(MemoryGraphStore::new());
    (harness(test_config(), graph.clone()).await, graph)
}

/// Files under the blob root, ignoring the salt and empty directories.
fn blob_files(root: &Path) -> usize {
    let mut count = 0;
    for entry in std::fs::read_dir(root).unwrap().filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            count += blob_files(&path);
        } else if entry.file_name() != ".salt" {
            count += 1;
        }
    }
    count
}

const THREE_PARAGRAPHS: &str = "Invoice Approval starts when a vendor invoice arrives.\n\n\
                                Invoice Approval is recorded in the Finance System.\n\n\
                                Payments are released on Fridays.\n";

#[tokio::test]
async fn happy_path_builds_graph_embeddings_and_lineage() {
    let (h, graph) = memory_harness().await;
    let engagement = Uuid::now_v7();
    let upload = Upload::new(engagement, "process.txt");

    let summary = h.pipeline.ingest(&upload, THREE_PARAGRAPHS.as_bytes()).await.unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    assert_eq!(summary.fragment_count, 3);
    assert_eq!(summary.entity_count, 2);
    assert_eq!(summary.embedding_count, 3);
    assert_eq!(summary.extraction_failures, 0);
    assert!(summary.duplicate_of.is_none());

    let relationships = graph.relationships(engagement).await.unwrap();
    assert!(relationships
        .iter()
        .any(|r| r.relation == RelationType::CoOccursWith));
    assert!(relationships.iter().any(|r| r.relation == RelationType::Uses));
    assert_eq!(relationships.len(), summary.relationship_count);

    let nodes = graph.nodes(engagement).await.unwrap();
    assert_eq!(nodes.len(), 3);
    let activity = nodes
        .iter()
        .find(|n| n.label == NodeLabel::Entity(EntityType::Activity))
        .unwrap();
    assert_eq!(activity.name, "Invoice Approval");
    assert_eq!(activity.properties["mention_count"], 2);

    let lineage = h.storage.lineage(summary.evidence_id).await.unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].embedded_fragment_ids.len(), 3);
    assert_eq!(lineage[0].node_keys.len(), 3);

    let item = h.pipeline.status(summary.evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::Completed);
    assert_eq!(item.validation_status, ValidationStatus::Valid);

    let hits = h
        .pipeline
        .search(engagement, "Invoice Approval is recorded in the Finance System.", 1)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("Finance System"));
}

#[tokio::test]
async fn duplicate_upload_links_without_new_artifacts() {
    let (h, graph) = memory_harness().await;
    let engagement = Uuid::now_v7();
    let first = h
        .pipeline
        .ingest(&Upload::new(engagement, "process.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();
    let writes_before = graph.write_calls();
    let blobs_before = blob_files(h.tmp.path());

    let second = h
        .pipeline
        .ingest(&Upload::new(engagement, "copy.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();

    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.duplicate_of, Some(first.evidence_id));
    assert_ne!(second.evidence_id, first.evidence_id);
    assert_eq!(second.fragment_count, 0);
    assert_eq!(second.entity_count, 0);
    assert_eq!(second.embedding_count, 0);
    assert_eq!(graph.write_calls(), writes_before);
    assert_eq!(blob_files(h.tmp.path()), blobs_before);
    assert_eq!(h.storage.count_fragments(second.evidence_id).await.unwrap(), 0);
    assert!(h.storage.lineage(second.evidence_id).await.unwrap().is_empty());

    let trail = h.pipeline.recorder().audit_trail(engagement).await.unwrap();
    assert_eq!(
        trail.last().map(|e| e.action),
        Some(AuditAction::EvidenceDuplicate)
    );
}

#[tokio::test]
async fn same_bytes_in_another_engagement_is_not_a_duplicate() {
    let (h, _graph) = memory_harness().await;
    let a = h
        .pipeline
        .ingest(&Upload::new(Uuid::now_v7(), "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();
    let b = h
        .pipeline
        .ingest(&Upload::new(Uuid::now_v7(), "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();

    assert_eq!(a.status, IngestStatus::Completed);
    assert_eq!(b.status, IngestStatus::Completed);
}

#[tokio::test]
async fn concurrent_identical_uploads_produce_one_original() {
    let (h, _graph) = memory_harness().await;
    let engagement = Uuid::now_v7();

    let first = h
        .pipeline
        .spawn_ingest(Upload::new(engagement, "a.txt"), THREE_PARAGRAPHS.as_bytes().to_vec());
    let second = h
        .pipeline
        .spawn_ingest(Upload::new(engagement, "b.txt"), THREE_PARAGRAPHS.as_bytes().to_vec());
    let results = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

    let originals = results
        .iter()
        .filter(|s| s.status == IngestStatus::Completed)
        .count();
    assert_eq!(originals, 1);
    assert_eq!(h.storage.list_evidence(engagement).await.unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_upload_is_rejected_before_any_write() {
    let graph = Arc::new(MemoryGraphStore::new());
    let h = harness(test_config().with_max_upload_bytes(16), graph.clone()).await;
    let engagement = Uuid::now_v7();

    let err = h
        .pipeline
        .ingest(&Upload::new(engagement, "process.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::FileTooLarge { limit: 16, .. })
    ));
    assert!(!err.is_retryable());
    assert!(h.storage.list_evidence(engagement).await.unwrap().is_empty());
    assert!(h.storage.list_audit(engagement).await.unwrap().is_empty());
    assert_eq!(blob_files(h.tmp.path()), 0);
    assert_eq!(graph.write_calls(), 0);
}

#[tokio::test]
async fn oversized_stream_without_size_hint_is_rejected() {
    let graph = Arc::new(MemoryGraphStore::new());
    let h = harness(test_config().with_max_upload_bytes(16), graph).await;
    let engagement = Uuid::now_v7();

    let err = h
        .pipeline
        .ingest_reader(&Upload::new(engagement, "p.txt"), THREE_PARAGRAPHS.as_bytes(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Validation(ValidationError::FileTooLarge { .. })));
    assert!(h.storage.list_evidence(engagement).await.unwrap().is_empty());
    assert_eq!(blob_files(h.tmp.path()), 0);
}

#[tokio::test]
async fn malformed_structured_file_fails_parse_without_fragments() {
    let (h, graph) = memory_harness().await;
    let engagement = Uuid::now_v7();
    let upload = Upload::new(engagement, "steps.json");

    let err = h
        .pipeline
        .ingest(&upload, br#"{"steps": ["Invoice Approval", "#)
        .await
        .unwrap_err();

    let IngestError::Stage {
        evidence_id,
        stage,
        source,
    } = &err
    else {
        panic!("expected a stage failure, got {err:?}");
    };
    assert_eq!(*stage, Stage::Parsed);
    assert!(matches!(source, StageError::Parse(_)));
    assert!(!err.is_retryable());
    assert!(err.user_message().starts_with("The file could not be parsed"));

    assert_eq!(h.storage.count_fragments(*evidence_id).await.unwrap(), 0);
    assert_eq!(graph.write_calls(), 0);
    let item = h.storage.get_evidence(*evidence_id).await.unwrap();
    assert_eq!(item.validation_status, ValidationStatus::Rejected);
    assert_eq!(item.stage, Stage::Validated);
    assert_eq!(item.failure.map(|f| f.stage), Some(Stage::Parsed));

    let trail = h.storage.list_audit(engagement).await.unwrap();
    assert_eq!(trail.last().map(|e| e.action), Some(AuditAction::EvidenceFailed));
}

#[tokio::test]
async fn failed_fragment_does_not_fail_the_item() {
    let (h, graph) = memory_harness().await;
    let engagement = Uuid::now_v7();
    let text = "FAIL while reading Invoice Approval.\n\n\
                Invoice Approval happens daily.\n\n\
                Results land in the Finance System.\n";

    let summary = h
        .pipeline
        .ingest(&Upload::new(engagement, "p.txt"), text.as_bytes())
        .await
        .unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    assert_eq!(summary.extraction_failures, 1);
    assert_eq!(summary.entity_count, 2);

    let fragments = h.storage.list_fragments(summary.evidence_id).await.unwrap();
    let failed_fragment = fragments[0].id.to_string();
    let nodes = graph.nodes(engagement).await.unwrap();
    assert!(nodes.iter().all(|n| {
        n.properties["fragment_ids"]
            .as_array()
            .is_none_or(|ids| ids.iter().all(|id| id != failed_fragment.as_str()))
    }));
}

fn many_entities_text(count: usize) -> String {
    (1..=count)
        .map(|i| format!("Step {i:02} runs in the Finance System."))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn many_entities_extractor(count: usize) -> ScriptedExtractor {
    let names: Vec<String> = (1..=count).map(|i| format!("Step {i:02}")).collect();
    let mut vocabulary: Vec<(EntityType, &str, f64)> = names
        .iter()
        .map(|n| (EntityType::Activity, n.as_str(), 0.8))
        .collect();
    vocabulary.push((EntityType::System, "Finance System", 0.8));
    ScriptedExtractor::new(&vocabulary)
}

#[tokio::test]
async fn graph_write_calls_do_not_grow_with_entity_count() {
    let mut calls = Vec::new();
    for count in [3, 40] {
        let graph = Arc::new(MemoryGraphStore::new());
        let h = harness(test_config(), graph.clone()).await;
        let pipeline = h
            .pipeline
            .clone()
            .with_extractor(Arc::new(many_entities_extractor(count)));

        let summary = pipeline
            .ingest(
                &Upload::new(Uuid::now_v7(), "steps.txt"),
                many_entities_text(count).as_bytes(),
            )
            .await
            .unwrap();
        assert_eq!(summary.entity_count, count + 1);
        calls.push(graph.write_calls());
    }

    assert_eq!(calls[0], calls[1]);
    // Evidence, Activity and System nodes; SUPPORTED_BY, CO_OCCURS_WITH and USES edges.
    assert_eq!(calls[0], 6);
}

#[tokio::test]
async fn reprocess_after_graph_failure_resumes_without_duplicates() {
    let store = Arc::new(SwitchableStore {
        inner: MemoryGraphStore::new(),
        reject_relationships: AtomicBool::new(true),
    });
    let h = harness(test_config(), store.clone()).await;
    let engagement = Uuid::now_v7();

    let err = h
        .pipeline
        .ingest(&Upload::new(engagement, "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::GraphWritten));
    assert!(err.is_retryable());
    assert_eq!(err.user_message(), "Processing incomplete, please retry");

    let IngestError::Stage { evidence_id, .. } = err else {
        panic!("expected a stage failure");
    };
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::Parsed);
    assert!(h.storage.lineage(evidence_id).await.unwrap().is_empty());
    let partial_nodes = store.nodes(engagement).await.unwrap().len();
    assert_eq!(partial_nodes, 3);

    store.reject_relationships.store(false, Ordering::SeqCst);
    let summary = h.pipeline.reprocess(evidence_id).await.unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    assert_eq!(store.nodes(engagement).await.unwrap().len(), partial_nodes);
    assert_eq!(
        store.relationships(engagement).await.unwrap().len(),
        summary.relationship_count
    );
    assert_eq!(summary.fragment_count, 3);
    assert_eq!(h.storage.count_fragments(evidence_id).await.unwrap(), 3);
    assert_eq!(h.storage.lineage(evidence_id).await.unwrap().len(), 1);

    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::Completed);
    assert!(item.failure.is_none());
}

#[tokio::test]
async fn reprocess_after_embedding_failure_keeps_graph_untouched() {
    let graph = Arc::new(MemoryGraphStore::new());
    let mut vectors = None;
    let h = harness_with_vectors(test_config(), graph.clone(), |inner| {
        let store = Arc::new(SwitchableVectors {
            inner,
            reject_writes: AtomicBool::new(true),
        });
        vectors = Some(store.clone());
        store
    })
    .await;
    let vectors = vectors.unwrap();
    let engagement = Uuid::now_v7();

    let err = h
        .pipeline
        .ingest(&Upload::new(engagement, "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::EmbeddingsWritten));
    let IngestError::Stage { evidence_id, .. } = err else {
        panic!("expected a stage failure");
    };
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::GraphWritten);
    assert_eq!(item.failure.unwrap().stage, Stage::EmbeddingsWritten);
    assert!(h.storage.lineage(evidence_id).await.unwrap().is_empty());
    let writes_before = graph.write_calls();
    let nodes_before = graph.nodes(engagement).await.unwrap().len();

    vectors.reject_writes.store(false, Ordering::SeqCst);
    let summary = h.pipeline.reprocess(evidence_id).await.unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    assert_eq!(summary.embedding_count, 3);
    assert_eq!(graph.write_calls(), writes_before);
    assert_eq!(graph.nodes(engagement).await.unwrap().len(), nodes_before);
    assert_eq!(vectors.embedded_fragments(evidence_id).await.unwrap().len(), 3);
    assert_eq!(h.storage.lineage(evidence_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn completion_is_not_recorded_without_lineage() {
    let (h, graph) = memory_harness().await;
    sqlx::query(
        "CREATE TRIGGER block_lineage BEFORE INSERT ON lineage_records \
         BEGIN SELECT RAISE(ABORT, 'lineage blocked'); END",
    )
    .execute(h.storage.pool())
    .await
    .unwrap();

    let err = h
        .pipeline
        .ingest(&Upload::new(Uuid::now_v7(), "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Completed));
    let IngestError::Stage { evidence_id, .. } = err else {
        panic!("expected a stage failure");
    };
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::EmbeddingsWritten);
    assert_eq!(item.failure.unwrap().stage, Stage::Completed);
    assert!(h.storage.lineage(evidence_id).await.unwrap().is_empty());
    let writes_before = graph.write_calls();

    sqlx::query("DROP TRIGGER block_lineage")
        .execute(h.storage.pool())
        .await
        .unwrap();
    let summary = h.pipeline.reprocess(evidence_id).await.unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    assert_eq!(graph.write_calls(), writes_before);
    assert_eq!(summary.embedding_count, 3);
    assert_eq!(h.storage.lineage(evidence_id).await.unwrap().len(), 1);
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::Completed);
    assert!(item.failure.is_none());
}

#[tokio::test]
async fn successful_reprocess_clears_rejected_status() {
    let parser = Arc::new(FlakyTextParser {
        broken: AtomicBool::new(true),
    });
    let (h, _graph) = memory_harness().await;
    let pipeline = h
        .pipeline
        .clone()
        .with_parsers(ParserRegistry::new().with_parser(parser.clone()));

    let err = pipeline
        .ingest(&Upload::new(Uuid::now_v7(), "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap_err();
    let IngestError::Stage { evidence_id, .. } = err else {
        panic!("expected a stage failure");
    };
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.validation_status, ValidationStatus::Rejected);

    parser.broken.store(false, Ordering::SeqCst);
    let summary = pipeline.reprocess(evidence_id).await.unwrap();

    assert_eq!(summary.status, IngestStatus::Completed);
    let item = h.storage.get_evidence(evidence_id).await.unwrap();
    assert_eq!(item.stage, Stage::Completed);
    assert_eq!(item.validation_status, ValidationStatus::Valid);
}

#[tokio::test]
async fn graph_queries_never_cross_engagements() {
    let (h, graph) = memory_harness().await;
    let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

    let in_a = h
        .pipeline
        .ingest(&Upload::new(a, "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();
    assert!(graph.nodes(b).await.unwrap().is_empty());
    assert!(graph.relationships(b).await.unwrap().is_empty());
    assert!(h.pipeline.search(b, "invoice approval", 10).await.unwrap().is_empty());

    let in_b = h
        .pipeline
        .ingest(&Upload::new(b, "p.txt"), THREE_PARAGRAPHS.as_bytes())
        .await
        .unwrap();

    let nodes_b = graph.nodes(b).await.unwrap();
    assert_eq!(nodes_b.len(), 3);
    assert!(nodes_b
        .iter()
        .all(|n| n.engagement_id == b && n.evidence_id == in_b.evidence_id));
    let keys_a: Vec<String> = graph
        .nodes(a)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.key)
        .collect();
    assert!(nodes_b.iter().all(|n| !keys_a.contains(&n.key)));
    assert!(graph
        .relationships(b)
        .await
        .unwrap()
        .iter()
        .all(|r| r.engagement_id == b && r.evidence_id != in_a.evidence_id));
}
