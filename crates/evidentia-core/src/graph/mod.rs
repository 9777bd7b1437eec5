mod builder;
mod memory;
mod model;
mod sqlite;

pub use builder::{GraphBatch, GraphPlan, GraphWriteError, KnowledgeGraphBuilder};
pub use memory::MemoryGraphStore;
pub use model::{GraphNode, GraphRelationship, NodeLabel};
pub use sqlite::SqliteGraphStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::relationship::RelationType;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph write for evidence {0} has no engagement")]
    MissingEngagement(Uuid),
    #[error("Batch for {expected} contains an item labelled {found}")]
    MixedBatch { expected: String, found: String },
    #[error("Relationship {key} references missing node {node}")]
    DanglingRelationship { key: String, node: String },
    #[error("Key {0} already belongs to another engagement")]
    TenancyConflict(String),
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] crate::Error),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Keys of every node and relationship written for one evidence item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphKeys {
    pub nodes: Vec<String>,
    pub relationships: Vec<String>,
}

impl GraphKeys {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}

/// Property graph partitioned by `engagement_id`.
///
/// Each upsert call is one atomic batch: either every item in it is
/// written or none is. Upserts are keyed, so replaying a batch leaves the
/// graph unchanged. Reads and deletes never cross engagements.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_nodes(&self, label: NodeLabel, nodes: &[GraphNode]) -> GraphResult<usize>;

    async fn upsert_relationships(
        &self,
        relation: RelationType,
        relationships: &[GraphRelationship],
    ) -> GraphResult<usize>;

    async fn nodes(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphNode>>;

    async fn relationships(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphRelationship>>;

    /// Deletes the given keys within one engagement. Removing a node also
    /// removes its relationships.
    async fn delete_keys(
        &self,
        engagement_id: Uuid,
        node_keys: &[String],
        relationship_keys: &[String],
    ) -> GraphResult<usize>;

    async fn delete_evidence(&self, engagement_id: Uuid, evidence_id: Uuid) -> GraphResult<usize>;

    async fn delete_engagement(&self, engagement_id: Uuid) -> GraphResult<usize>;
}

pub(crate) fn check_node_batch(label: NodeLabel, nodes: &[GraphNode]) -> GraphResult<()> {
    for node in nodes {
        if node.engagement_id.is_nil() {
            return Err(GraphError::MissingEngagement(node.evidence_id));
        }
        if node.label != label {
            return Err(GraphError::MixedBatch {
                expected: label.to_string(),
                found: node.label.to_string(),
            });
        }
    }
    Ok(())
}

pub(crate) fn check_relationship_batch(
    relation: RelationType,
    relationships: &[GraphRelationship],
) -> GraphResult<()> {
    for rel in relationships {
        if rel.engagement_id.is_nil() {
            return Err(GraphError::MissingEngagement(rel.evidence_id));
        }
        if rel.relation != relation {
            return Err(GraphError::MixedBatch {
                expected: relation.to_string(),
                found: rel.relation.to_string(),
            });
        }
    }
    Ok(())
}
