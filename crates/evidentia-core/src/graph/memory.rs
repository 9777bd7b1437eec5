use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::Direction;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    check_node_batch, check_relationship_batch, GraphError, GraphNode, GraphRelationship,
    GraphResult, GraphStore, NodeLabel,
};
use crate::relationship::RelationType;

#[derive(Default)]
struct Inner {
    graph: StableDiGraph<GraphNode, GraphRelationship>,
    nodes: HashMap<String, NodeIndex>,
    edges: HashMap<String, EdgeIndex>,
}

impl Inner {
    fn remove_node(&mut self, index: NodeIndex) -> usize {
        let incident: Vec<String> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .chain(self.graph.edges_directed(index, Direction::Incoming))
            .map(|edge| edge.weight().key.clone())
            .collect();
        for key in &incident {
            self.edges.remove(key);
        }
        if let Some(node) = self.graph.remove_node(index) {
            self.nodes.remove(&node.key);
        }
        incident.len() + 1
    }

    fn remove_edge(&mut self, index: EdgeIndex) -> usize {
        match self.graph.remove_edge(index) {
            Some(edge) => {
                self.edges.remove(&edge.key);
                1
            }
            None => 0,
        }
    }

    fn retain(&mut self, mut doomed_node: impl FnMut(&GraphNode) -> bool) -> usize {
        let doomed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| doomed_node(&self.graph[i]))
            .collect();
        doomed.into_iter().map(|i| self.remove_node(i)).sum()
    }
}

/// In-process graph store on a `petgraph` stable graph.
///
/// Counts upsert calls, which makes the number of store round trips per
/// ingestion observable.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<Inner>,
    write_calls: AtomicUsize,
}

impl MemoryGraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.graph.node_count()
    }

    pub async fn relationship_count(&self) -> usize {
        self.inner.read().await.graph.edge_count()
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_nodes(&self, label: NodeLabel, nodes: &[GraphNode]) -> GraphResult<usize> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        check_node_batch(label, nodes)?;

        let mut inner = self.inner.write().await;
        for node in nodes {
            if let Some(&index) = inner.nodes.get(&node.key) {
                if inner.graph[index].engagement_id != node.engagement_id {
                    return Err(GraphError::TenancyConflict(node.key.clone()));
                }
            }
        }

        for node in nodes {
            match inner.nodes.get(&node.key).copied() {
                Some(index) => inner.graph[index] = node.clone(),
                None => {
                    let index = inner.graph.add_node(node.clone());
                    inner.nodes.insert(node.key.clone(), index);
                }
            }
        }
        Ok(nodes.len())
    }

    async fn upsert_relationships(
        &self,
        relation: RelationType,
        relationships: &[GraphRelationship],
    ) -> GraphResult<usize> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        check_relationship_batch(relation, relationships)?;

        let mut inner = self.inner.write().await;
        let mut endpoints = Vec::with_capacity(relationships.len());
        for rel in relationships {
            let resolve = |key: &str| -> GraphResult<NodeIndex> {
                let index = *inner.nodes.get(key).ok_or_else(|| GraphError::DanglingRelationship {
                    key: rel.key.clone(),
                    node: key.to_string(),
                })?;
                if inner.graph[index].engagement_id == rel.engagement_id {
                    Ok(index)
                } else {
                    Err(GraphError::TenancyConflict(rel.key.clone()))
                }
            };
            let source = resolve(&rel.source)?;
            let target = resolve(&rel.target)?;
            if let Some(&existing) = inner.edges.get(&rel.key) {
                if inner.graph[existing].engagement_id != rel.engagement_id {
                    return Err(GraphError::TenancyConflict(rel.key.clone()));
                }
            }
            endpoints.push((source, target));
        }

        for (rel, (source, target)) in relationships.iter().zip(endpoints) {
            match inner.edges.get(&rel.key).copied() {
                Some(index) => inner.graph[index] = rel.clone(),
                None => {
                    let index = inner.graph.add_edge(source, target, rel.clone());
                    inner.edges.insert(rel.key.clone(), index);
                }
            }
        }
        Ok(relationships.len())
    }

    async fn nodes(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphNode>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<GraphNode> = inner
            .graph
            .node_weights()
            .filter(|n| n.engagement_id == engagement_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn relationships(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphRelationship>> {
        let inner = self.inner.read().await;
        let mut rels: Vec<GraphRelationship> = inner
            .graph
            .edge_weights()
            .filter(|r| r.engagement_id == engagement_id)
            .cloned()
            .collect();
        rels.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rels)
    }

    async fn delete_keys(
        &self,
        engagement_id: Uuid,
        node_keys: &[String],
        relationship_keys: &[String],
    ) -> GraphResult<usize> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;

        for key in relationship_keys {
            if let Some(index) = inner.edges.get(key).copied() {
                if inner.graph[index].engagement_id == engagement_id {
                    removed += inner.remove_edge(index);
                }
            }
        }
        for key in node_keys {
            if let Some(index) = inner.nodes.get(key).copied() {
                if inner.graph[index].engagement_id == engagement_id {
                    removed += inner.remove_node(index);
                }
            }
        }
        Ok(removed)
    }

    async fn delete_evidence(&self, engagement_id: Uuid, evidence_id: Uuid) -> GraphResult<usize> {
        let mut inner = self.inner.write().await;
        Ok(inner.retain(|n| n.engagement_id == engagement_id && n.evidence_id == evidence_id))
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> GraphResult<usize> {
        let mut inner = self.inner.write().await;
        Ok(inner.retain(|n| n.engagement_id == engagement_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::EntityType;

    fn node(key: &str, engagement_id: Uuid) -> GraphNode {
        GraphNode {
            key: key.into(),
            label: NodeLabel::Entity(EntityType::Activity),
            engagement_id,
            evidence_id: Uuid::nil(),
            name: key.into(),
            properties: json!({}),
        }
    }

    fn rel(key: &str, source: &str, target: &str, engagement_id: Uuid) -> GraphRelationship {
        GraphRelationship {
            key: key.into(),
            relation: RelationType::CoOccursWith,
            source: source.into(),
            target: target.into(),
            engagement_id,
            evidence_id: Uuid::nil(),
            properties: json!({}),
        }
    }

    const ACTIVITY: NodeLabel = NodeLabel::Entity(EntityType::Activity);

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryGraphStore::new();
        let engagement = Uuid::now_v7();
        let nodes = vec![node("a", engagement), node("b", engagement)];
        let rels = vec![rel("ab", "a", "b", engagement)];

        for _ in 0..2 {
            store.upsert_nodes(ACTIVITY, &nodes).await.unwrap();
            store
                .upsert_relationships(RelationType::CoOccursWith, &rels)
                .await
                .unwrap();
        }

        assert_eq!(store.node_count().await, 2);
        assert_eq!(store.relationship_count().await, 1);
        assert_eq!(store.write_calls(), 4);
    }

    #[tokio::test]
    async fn test_batch_with_dangling_edge_writes_nothing() {
        let store = MemoryGraphStore::new();
        let engagement = Uuid::now_v7();
        store
            .upsert_nodes(ACTIVITY, &[node("a", engagement), node("b", engagement)])
            .await
            .unwrap();

        let result = store
            .upsert_relationships(
                RelationType::CoOccursWith,
                &[rel("ab", "a", "b", engagement), rel("ax", "a", "x", engagement)],
            )
            .await;

        assert!(matches!(result, Err(GraphError::DanglingRelationship { .. })));
        assert_eq!(store.relationship_count().await, 0);
    }

    #[tokio::test]
    async fn test_reads_and_deletes_are_engagement_scoped() {
        let store = MemoryGraphStore::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        store.upsert_nodes(ACTIVITY, &[node("a1", a)]).await.unwrap();
        store.upsert_nodes(ACTIVITY, &[node("b1", b)]).await.unwrap();

        assert_eq!(store.nodes(a).await.unwrap().len(), 1);
        assert_eq!(store.delete_keys(a, &["b1".into()], &[]).await.unwrap(), 0);
        assert_eq!(store.delete_engagement(a).await.unwrap(), 1);
        assert!(store.nodes(a).await.unwrap().is_empty());
        assert_eq!(store.nodes(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_nil_engagement_and_foreign_keys() {
        let store = MemoryGraphStore::new();
        let result = store.upsert_nodes(ACTIVITY, &[node("a", Uuid::nil())]).await;
        assert!(matches!(result, Err(GraphError::MissingEngagement(_))));

        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        store.upsert_nodes(ACTIVITY, &[node("k", a)]).await.unwrap();
        let result = store.upsert_nodes(ACTIVITY, &[node("k", b)]).await;
        assert!(matches!(result, Err(GraphError::TenancyConflict(_))));
    }

    #[tokio::test]
    async fn test_deleting_node_drops_its_edges() {
        let store = MemoryGraphStore::new();
        let engagement = Uuid::now_v7();
        store
            .upsert_nodes(ACTIVITY, &[node("a", engagement), node("b", engagement)])
            .await
            .unwrap();
        store
            .upsert_relationships(RelationType::CoOccursWith, &[rel("ab", "a", "b", engagement)])
            .await
            .unwrap();

        let removed = store.delete_keys(engagement, &["b".into()], &[]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.relationships(engagement).await.unwrap().is_empty());
    }
}
