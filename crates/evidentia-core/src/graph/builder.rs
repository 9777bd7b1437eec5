use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use super::{GraphError, GraphKeys, GraphNode, GraphRelationship, GraphResult, GraphStore, NodeLabel};
use crate::evidence::EvidenceItem;
use crate::ingest::ResolvedEntity;
use crate::relationship::{RelationType, SEMANTIC_BRIDGES};

/// One bulk write: all nodes of a label, or all relationships of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphBatch {
    Nodes(NodeLabel),
    Relationships(RelationType),
}

impl fmt::Display for GraphBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nodes(label) => write!(f, "{label} nodes"),
            Self::Relationships(relation) => write!(f, "{relation} relationships"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{batch} failed after {attempts} attempt(s): {source}")]
pub struct GraphWriteError {
    pub batch: GraphBatch,
    /// Batches committed earlier in the same run; they are left in place.
    pub committed: Vec<GraphBatch>,
    pub attempts: u32,
    #[source]
    pub source: GraphError,
}

/// Everything one evidence item contributes to the graph, grouped the way
/// it is written.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    pub engagement_id: Uuid,
    pub evidence_id: Uuid,
    pub nodes: BTreeMap<NodeLabel, Vec<GraphNode>>,
    pub relationships: BTreeMap<RelationType, Vec<GraphRelationship>>,
}

impl GraphPlan {
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.nodes.len() + self.relationships.len()
    }

    #[must_use]
    pub fn keys(&self) -> GraphKeys {
        GraphKeys {
            nodes: self.nodes.values().flatten().map(|n| n.key.clone()).collect(),
            relationships: self
                .relationships
                .values()
                .flatten()
                .map(|r| r.key.clone())
                .collect(),
        }
    }

    fn relate(
        &mut self,
        relation: RelationType,
        source: &str,
        target: &str,
        properties: serde_json::Value,
    ) {
        let key = GraphRelationship::stable_key(self.evidence_id, relation, source, target);
        let (source, target) = if relation.is_symmetric() && target < source {
            (target, source)
        } else {
            (source, target)
        };
        self.relationships
            .entry(relation)
            .or_default()
            .push(GraphRelationship {
                key,
                relation,
                source: source.to_string(),
                target: target.to_string(),
                engagement_id: self.engagement_id,
                evidence_id: self.evidence_id,
                properties,
            });
    }
}

/// Turns resolved entities into graph writes, one store call per label and
/// per relationship type.
#[derive(Clone)]
pub struct KnowledgeGraphBuilder {
    store: Arc<dyn GraphStore>,
    retries: u32,
    backoff: Duration,
}

impl KnowledgeGraphBuilder {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Builds the node and relationship sets without touching the store.
    pub fn plan(&self, item: &EvidenceItem, entities: &[ResolvedEntity]) -> GraphResult<GraphPlan> {
        if item.engagement_id.is_nil() {
            return Err(GraphError::MissingEngagement(item.id));
        }

        let mut plan = GraphPlan {
            engagement_id: item.engagement_id,
            evidence_id: item.id,
            nodes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        };

        let evidence_key = item.id.to_string();
        plan.nodes.entry(NodeLabel::Evidence).or_default().push(GraphNode {
            key: evidence_key.clone(),
            label: NodeLabel::Evidence,
            engagement_id: item.engagement_id,
            evidence_id: item.id,
            name: item.name.clone(),
            properties: json!({
                "fingerprint": item.fingerprint,
                "format": item.detected_format,
                "classification": item.classification.as_str(),
            }),
        });

        let mut by_fragment: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
        for entity in entities {
            let key = entity.id.to_string();
            let label = NodeLabel::Entity(entity.entity_type);
            plan.nodes.entry(label).or_default().push(GraphNode {
                key: key.clone(),
                label,
                engagement_id: item.engagement_id,
                evidence_id: item.id,
                name: entity.canonical_name.clone(),
                properties: json!({
                    "normalized_name": entity.normalized_name,
                    "aliases": entity.aliases,
                    "confidence": entity.confidence,
                    "mention_count": entity.mention_count,
                    "fragment_ids": entity.fragment_ids,
                }),
            });
            plan.relate(
                RelationType::SupportedBy,
                &key,
                &evidence_key,
                json!({
                    "source": "extraction",
                    "confidence": entity.confidence,
                    "fragment_count": entity.fragment_ids.len(),
                }),
            );
            for fragment_id in &entity.fragment_ids {
                by_fragment.entry(*fragment_id).or_default().push(key.clone());
            }
        }

        let mut pairs: BTreeMap<(String, String), usize> = BTreeMap::new();
        for keys in by_fragment.values_mut() {
            keys.sort();
            keys.dedup();
            for (i, a) in keys.iter().enumerate() {
                for b in &keys[i + 1..] {
                    *pairs.entry((a.clone(), b.clone())).or_default() += 1;
                }
            }
        }
        for ((a, b), shared) in pairs {
            plan.relate(
                RelationType::CoOccursWith,
                &a,
                &b,
                json!({ "inferred": true, "fragment_count": shared }),
            );
        }

        for bridge in SEMANTIC_BRIDGES {
            let rule = format!("{}->{}", bridge.source, bridge.target);
            for source in entities.iter().filter(|e| e.entity_type == bridge.source) {
                for target in entities.iter().filter(|e| e.entity_type == bridge.target) {
                    if source.id == target.id {
                        continue;
                    }
                    plan.relate(
                        bridge.relation,
                        &source.id.to_string(),
                        &target.id.to_string(),
                        json!({ "inferred": true, "rule": rule }),
                    );
                }
            }
        }

        Ok(plan)
    }

    /// Writes every batch of `plan`, retrying a failed batch with backoff.
    /// Batches committed before a final failure stay committed.
    pub async fn write(&self, plan: &GraphPlan) -> Result<GraphKeys, GraphWriteError> {
        let mut committed = Vec::with_capacity(plan.batch_count());

        for (label, nodes) in &plan.nodes {
            let batch = GraphBatch::Nodes(*label);
            self.retrying(batch, &committed, || self.store.upsert_nodes(*label, nodes))
                .await?;
            committed.push(batch);
        }
        for (relation, rels) in &plan.relationships {
            let batch = GraphBatch::Relationships(*relation);
            self.retrying(batch, &committed, || {
                self.store.upsert_relationships(*relation, rels)
            })
            .await?;
            committed.push(batch);
        }

        tracing::debug!(
            evidence_id = %plan.evidence_id,
            batches = committed.len(),
            nodes = plan.node_count(),
            relationships = plan.relationship_count(),
            "Graph batches committed"
        );
        Ok(plan.keys())
    }

    async fn retrying<F, Fut>(
        &self,
        batch: GraphBatch,
        committed: &[GraphBatch],
        mut op: F,
    ) -> Result<(), GraphWriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GraphResult<usize>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt <= self.retries && is_transient(&e) => {
                    tracing::warn!("{} write attempt {} failed: {}", batch, attempt, e);
                    tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(e) => {
                    return Err(GraphWriteError {
                        batch,
                        committed: committed.to_vec(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

/// Errors a replay of the same batch could clear. Constraint and schema
/// errors fail the same way every time.
fn is_transient(error: &GraphError) -> bool {
    match error {
        GraphError::Unavailable(_) => true,
        GraphError::Database(e) => is_contention(e),
        _ => false,
    }
}

/// Pool exhaustion, I/O hiccups, or SQLite `BUSY`/`LOCKED` (primary codes 5
/// and 6, under any extended code).
fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}
