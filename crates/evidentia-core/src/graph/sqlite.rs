use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::{
    check_node_batch, check_relationship_batch, GraphError, GraphNode, GraphRelationship,
    GraphResult, GraphStore, NodeLabel,
};
use crate::relationship::RelationType;

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS graph_nodes (
    key TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    engagement_id TEXT NOT NULL,
    evidence_id TEXT NOT NULL,
    name TEXT NOT NULL,
    properties TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_graph_nodes_engagement ON graph_nodes(engagement_id, label);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_evidence ON graph_nodes(evidence_id);

CREATE TABLE IF NOT EXISTS graph_relationships (
    key TEXT PRIMARY KEY,
    relation TEXT NOT NULL,
    source_key TEXT NOT NULL REFERENCES graph_nodes(key) ON DELETE CASCADE,
    target_key TEXT NOT NULL REFERENCES graph_nodes(key) ON DELETE CASCADE,
    engagement_id TEXT NOT NULL,
    evidence_id TEXT NOT NULL,
    properties TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_graph_rels_engagement ON graph_relationships(engagement_id, relation);
CREATE INDEX IF NOT EXISTS idx_graph_rels_source ON graph_relationships(source_key);
CREATE INDEX IF NOT EXISTS idx_graph_rels_target ON graph_relationships(target_key);
";

const BATCH_ROWS: usize = 500;

/// Graph tables in a SQLite database, usually the one [`crate::Storage`]
/// already holds.
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    pool: Pool<Sqlite>,
}

impl SqliteGraphStore {
    pub async fn new(pool: Pool<Sqlite>) -> GraphResult<Self> {
        sqlx::query(INIT_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_nodes(&self, label: NodeLabel, nodes: &[GraphNode]) -> GraphResult<usize> {
        check_node_batch(label, nodes)?;
        if nodes.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in nodes.chunks(BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO graph_nodes (key, label, engagement_id, evidence_id, name, properties) ",
            );
            builder.push_values(chunk, |mut b, node| {
                b.push_bind(&node.key)
                    .push_bind(node.label.as_str())
                    .push_bind(node.engagement_id.to_string())
                    .push_bind(node.evidence_id.to_string())
                    .push_bind(&node.name)
                    .push_bind(node.properties.to_string());
            });
            builder.push(
                " ON CONFLICT(key) DO UPDATE SET \
                    label = excluded.label, \
                    name = excluded.name, \
                    properties = excluded.properties \
                  WHERE graph_nodes.engagement_id = excluded.engagement_id",
            );
            let result = builder.build().execute(&mut *tx).await?;
            if result.rows_affected() < chunk.len() as u64 {
                return Err(GraphError::TenancyConflict(format!(
                    "{} node batch",
                    label.as_str()
                )));
            }
        }
        tx.commit().await?;
        Ok(nodes.len())
    }

    async fn upsert_relationships(
        &self,
        relation: RelationType,
        relationships: &[GraphRelationship],
    ) -> GraphResult<usize> {
        check_relationship_batch(relation, relationships)?;
        if relationships.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in relationships.chunks(BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO graph_relationships \
                 (key, relation, source_key, target_key, engagement_id, evidence_id, properties) ",
            );
            builder.push_values(chunk, |mut b, rel| {
                b.push_bind(&rel.key)
                    .push_bind(rel.relation.as_str())
                    .push_bind(&rel.source)
                    .push_bind(&rel.target)
                    .push_bind(rel.engagement_id.to_string())
                    .push_bind(rel.evidence_id.to_string())
                    .push_bind(rel.properties.to_string());
            });
            builder.push(
                " ON CONFLICT(key) DO UPDATE SET properties = excluded.properties \
                  WHERE graph_relationships.engagement_id = excluded.engagement_id",
            );
            let result = builder.build().execute(&mut *tx).await?;
            if result.rows_affected() < chunk.len() as u64 {
                return Err(GraphError::TenancyConflict(format!("{relation} batch")));
            }

            // Endpoints must exist within the relationship's own engagement.
            let mut check: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT r.key, r.source_key, r.target_key, s.key AS found_source \
                 FROM graph_relationships r \
                 LEFT JOIN graph_nodes s ON s.key = r.source_key AND s.engagement_id = r.engagement_id \
                 LEFT JOIN graph_nodes t ON t.key = r.target_key AND t.engagement_id = r.engagement_id \
                 WHERE (s.key IS NULL OR t.key IS NULL) AND r.key IN (",
            );
            push_key_list(&mut check, chunk.iter().map(|rel| rel.key.clone()));
            check.push(" LIMIT 1");
            if let Some(row) = check.build().fetch_optional(&mut *tx).await? {
                let key: String = row.try_get("key")?;
                let found_source: Option<String> = row.try_get("found_source")?;
                let node: String = if found_source.is_none() {
                    row.try_get("source_key")?
                } else {
                    row.try_get("target_key")?
                };
                return Err(GraphError::DanglingRelationship { key, node });
            }
        }

        tx.commit().await?;
        Ok(relationships.len())
    }

    async fn nodes(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphNode>> {
        let rows = sqlx::query(
            "SELECT key, label, engagement_id, evidence_id, name, properties \
             FROM graph_nodes WHERE engagement_id = ? ORDER BY key",
        )
        .bind(engagement_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_node_row).collect()
    }

    async fn relationships(&self, engagement_id: Uuid) -> GraphResult<Vec<GraphRelationship>> {
        let rows = sqlx::query(
            "SELECT key, relation, source_key, target_key, engagement_id, evidence_id, properties \
             FROM graph_relationships WHERE engagement_id = ? ORDER BY key",
        )
        .bind(engagement_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_relationship_row).collect()
    }

    async fn delete_keys(
        &self,
        engagement_id: Uuid,
        node_keys: &[String],
        relationship_keys: &[String],
    ) -> GraphResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for chunk in relationship_keys.chunks(BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM graph_relationships WHERE engagement_id = ");
            builder.push_bind(engagement_id.to_string()).push(" AND key IN (");
            let mut keys = builder.separated(", ");
            for key in chunk {
                keys.push_bind(key);
            }
            keys.push_unseparated(")");
            removed += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        for chunk in node_keys.chunks(BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "DELETE FROM graph_relationships WHERE engagement_id = ",
            );
            builder
                .push_bind(engagement_id.to_string())
                .push(" AND (source_key IN (");
            push_key_list(&mut builder, chunk.iter().cloned());
            builder.push(" OR target_key IN (");
            push_key_list(&mut builder, chunk.iter().cloned());
            builder.push(")");
            removed += builder.build().execute(&mut *tx).await?.rows_affected();

            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM graph_nodes WHERE engagement_id = ");
            builder.push_bind(engagement_id.to_string()).push(" AND key IN (");
            push_key_list(&mut builder, chunk.iter().cloned());
            removed += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn delete_evidence(&self, engagement_id: Uuid, evidence_id: Uuid) -> GraphResult<usize> {
        let mut tx = self.pool.begin().await?;
        let rels = sqlx::query(
            "DELETE FROM graph_relationships WHERE engagement_id = ? AND evidence_id = ?",
        )
        .bind(engagement_id.to_string())
        .bind(evidence_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let nodes = sqlx::query("DELETE FROM graph_nodes WHERE engagement_id = ? AND evidence_id = ?")
            .bind(engagement_id.to_string())
            .bind(evidence_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(usize::try_from(rels + nodes).unwrap_or(usize::MAX))
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> GraphResult<usize> {
        let mut tx = self.pool.begin().await?;
        let rels = sqlx::query("DELETE FROM graph_relationships WHERE engagement_id = ?")
            .bind(engagement_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let nodes = sqlx::query("DELETE FROM graph_nodes WHERE engagement_id = ?")
            .bind(engagement_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(usize::try_from(rels + nodes).unwrap_or(usize::MAX))
    }
}

/// Pushes `?, ?, ...)` for the keys; the caller has already opened the list.
fn push_key_list(builder: &mut QueryBuilder<'_, Sqlite>, keys: impl IntoIterator<Item = String>) {
    let mut list = builder.separated(", ");
    for key in keys {
        list.push_bind(key);
    }
    list.push_unseparated(")");
}

fn parse_uuid(row: &SqliteRow, column: &str) -> GraphResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|_| crate::Error::invalid("uuid", raw).into())
}

fn parse_node_row(row: &SqliteRow) -> GraphResult<GraphNode> {
    let label: String = row.try_get("label")?;
    let properties: String = row.try_get("properties")?;
    Ok(GraphNode {
        key: row.try_get("key")?,
        label: label.parse()?,
        engagement_id: parse_uuid(row, "engagement_id")?,
        evidence_id: parse_uuid(row, "evidence_id")?,
        name: row.try_get("name")?,
        properties: serde_json::from_str(&properties)?,
    })
}

fn parse_relationship_row(row: &SqliteRow) -> GraphResult<GraphRelationship> {
    let relation: String = row.try_get("relation")?;
    let properties: String = row.try_get("properties")?;
    Ok(GraphRelationship {
        key: row.try_get("key")?,
        relation: relation.parse()?,
        source: row.try_get("source_key")?,
        target: row.try_get("target_key")?,
        engagement_id: parse_uuid(row, "engagement_id")?,
        evidence_id: parse_uuid(row, "evidence_id")?,
        properties: serde_json::from_str(&properties)?,
    })
}
