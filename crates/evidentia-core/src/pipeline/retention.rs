use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::orchestrator::{IngestError, IngestResult};
use crate::blob::BlobStore;
use crate::embedding::VectorStore;
use crate::evidence::EvidenceItem;
use crate::graph::GraphStore;
use crate::lineage::{AuditAction, AuditEntry};
use crate::storage::Storage;

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub evidence_items: usize,
    pub graph_items: usize,
    pub embeddings: usize,
    pub blobs: usize,
}

/// Deletes evidence and everything derived from it across the relational,
/// graph, vector and blob stores. The audit log keeps a record of each
/// purge.
#[derive(Clone)]
pub struct Retention {
    storage: Storage,
    blobs: Arc<dyn BlobStore>,
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorStore>,
}

impl Retention {
    #[must_use]
    pub fn new(
        storage: Storage,
        blobs: Arc<dyn BlobStore>,
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            storage,
            blobs,
            graph,
            vectors,
        }
    }

    /// Purges one item. Graph artifacts are located through lineage, or by
    /// their `evidence_id` property when the item never completed.
    /// Duplicates linked to the item go with it.
    pub async fn purge_evidence(&self, evidence_id: Uuid) -> IngestResult<PurgeReport> {
        let item = self.storage.get_evidence(evidence_id).await?;
        let linked = self
            .storage
            .list_evidence(item.engagement_id)
            .await?
            .iter()
            .filter(|other| other.duplicate_of == Some(item.id))
            .count();

        let mut report = PurgeReport {
            graph_items: self.purge_graph(&item).await?,
            ..PurgeReport::default()
        };
        report.embeddings = self
            .vectors
            .delete_evidence(item.id)
            .await
            .map_err(IngestError::Embedding)?;
        if let Some(handle) = &item.storage {
            self.blobs.delete(handle).await?;
            report.blobs = 1;
        }
        self.storage.delete_evidence(item.id).await?;
        report.evidence_items = 1 + linked;

        let entry = AuditEntry::for_item(&item, AuditAction::EvidencePurged)
            .with_detail("graph_items", report.graph_items)
            .with_detail("embeddings", report.embeddings)
            .with_detail("linked_duplicates", linked);
        self.storage.append_audit(&entry).await?;

        tracing::info!(
            evidence_id = %item.id,
            graph_items = report.graph_items,
            embeddings = report.embeddings,
            "Purged evidence"
        );
        Ok(report)
    }

    /// Purges every item of an engagement.
    pub async fn purge_engagement(&self, engagement_id: Uuid) -> IngestResult<PurgeReport> {
        let items = self.storage.list_evidence(engagement_id).await?;

        let report = PurgeReport {
            graph_items: self
                .graph
                .delete_engagement(engagement_id)
                .await
                .map_err(IngestError::Graph)?,
            embeddings: self
                .vectors
                .delete_engagement(engagement_id)
                .await
                .map_err(IngestError::Embedding)?,
            blobs: items.iter().filter(|item| item.has_blob()).count(),
            evidence_items: items.len(),
        };
        self.blobs.delete_engagement(engagement_id).await?;

        // Duplicates cascade with their originals.
        for item in items.iter().filter(|item| !item.is_duplicate()) {
            self.storage.delete_evidence(item.id).await?;
        }

        let entry = AuditEntry::new(
            engagement_id,
            None,
            AuditAction::EvidencePurged,
            serde_json::json!({
                "scope": "engagement",
                "evidence_items": report.evidence_items,
                "graph_items": report.graph_items,
                "embeddings": report.embeddings,
            }),
        );
        self.storage.append_audit(&entry).await?;

        tracing::info!(
            engagement_id = %engagement_id,
            evidence_items = report.evidence_items,
            graph_items = report.graph_items,
            "Purged engagement"
        );
        Ok(report)
    }

    async fn purge_graph(&self, item: &EvidenceItem) -> IngestResult<usize> {
        let mut nodes = BTreeSet::new();
        let mut relationships = BTreeSet::new();
        for record in self.storage.lineage(item.id).await? {
            nodes.extend(record.node_keys);
            relationships.extend(record.relationship_keys);
        }
        if let Some(keys) = &item.graph_keys {
            nodes.extend(keys.nodes.iter().cloned());
            relationships.extend(keys.relationships.iter().cloned());
        }

        let removed = if nodes.is_empty() && relationships.is_empty() {
            self.graph.delete_evidence(item.engagement_id, item.id).await
        } else {
            let nodes: Vec<String> = nodes.into_iter().collect();
            let relationships: Vec<String> = relationships.into_iter().collect();
            self.graph
                .delete_keys(item.engagement_id, &nodes, &relationships)
                .await
        };
        removed.map_err(IngestError::Graph)
    }
}
