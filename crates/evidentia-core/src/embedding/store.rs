use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::{Embedding, EmbeddingError, EmbeddingResult, FragmentVector};

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS fragment_embeddings (
    fragment_id TEXT PRIMARY KEY REFERENCES evidence_fragments(id) ON DELETE CASCADE,
    evidence_id TEXT NOT NULL,
    engagement_id TEXT NOT NULL,
    vector BLOB,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_engagement ON fragment_embeddings(engagement_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_evidence ON fragment_embeddings(evidence_id);
";

/// SQLite caps bound parameters at 32766; five per row.
const BATCH_ROWS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub fragment_id: Uuid,
    pub evidence_id: Uuid,
    pub content: String,
    pub score: f32,
}

/// Fragment vectors partitioned by engagement.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Stores every vector of one evidence item in a single write. `None`
    /// vectors are kept as placeholders that search skips.
    async fn upsert_batch(
        &self,
        engagement_id: Uuid,
        evidence_id: Uuid,
        vectors: &[FragmentVector],
    ) -> EmbeddingResult<usize>;

    /// Nearest fragments by cosine similarity within one engagement.
    async fn search(
        &self,
        engagement_id: Uuid,
        query: &Embedding,
        top_k: usize,
    ) -> EmbeddingResult<Vec<SearchHit>>;

    /// Fragments of `evidence_id` holding a non-null vector.
    async fn embedded_fragments(&self, evidence_id: Uuid) -> EmbeddingResult<Vec<Uuid>>;

    async fn delete_fragments(&self, fragment_ids: &[Uuid]) -> EmbeddingResult<usize>;

    async fn delete_evidence(&self, evidence_id: Uuid) -> EmbeddingResult<usize>;

    async fn delete_engagement(&self, engagement_id: Uuid) -> EmbeddingResult<usize>;
}

/// Vector store sharing the relational database. Similarity is computed in
/// process over the engagement's rows.
#[derive(Debug, Clone)]
pub struct SqliteVectorStore {
    pool: Pool<Sqlite>,
}

impl SqliteVectorStore {
    pub async fn new(pool: Pool<Sqlite>) -> EmbeddingResult<Self> {
        sqlx::query(INIT_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl VectorStore for SqliteVectorStore {
    async fn embedded_fragments(&self, evidence_id: Uuid) -> EmbeddingResult<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT fragment_id FROM fragment_embeddings \
             WHERE evidence_id = ? AND vector IS NOT NULL ORDER BY fragment_id",
        )
        .bind(evidence_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(raw,)| parse_uuid(&raw)).collect()
    }

    async fn upsert_batch(
        &self,
        engagement_id: Uuid,
        evidence_id: Uuid,
        vectors: &[FragmentVector],
    ) -> EmbeddingResult<usize> {
        if vectors.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut written = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in vectors.chunks(BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO fragment_embeddings (fragment_id, evidence_id, engagement_id, vector, updated_at) ",
            );
            builder.push_values(chunk, |mut row, fv| {
                row.push_bind(fv.fragment_id.to_string())
                    .push_bind(evidence_id.to_string())
                    .push_bind(engagement_id.to_string())
                    .push_bind(fv.vector.as_ref().map(Embedding::to_bytes))
                    .push_bind(now.clone());
            });
            builder.push(
                " ON CONFLICT(fragment_id) DO UPDATE SET vector = excluded.vector, \
                 updated_at = excluded.updated_at \
                 WHERE fragment_embeddings.engagement_id = excluded.engagement_id",
            );
            let result = builder.build().execute(&mut *tx).await?;
            written += usize::try_from(result.rows_affected()).unwrap_or_default();
        }

        tx.commit().await?;
        tracing::debug!(evidence_id = %evidence_id, rows = written, "Stored fragment vectors");
        Ok(written)
    }

    async fn search(
        &self,
        engagement_id: Uuid,
        query: &Embedding,
        top_k: usize,
    ) -> EmbeddingResult<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String, String, Vec<u8>)> = sqlx::query_as(
            r"
            SELECT e.fragment_id, e.evidence_id, f.content, e.vector
            FROM fragment_embeddings e
            JOIN evidence_fragments f ON f.id = e.fragment_id
            WHERE e.engagement_id = ? AND e.vector IS NOT NULL
            ",
        )
        .bind(engagement_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for (fragment_id, evidence_id, content, bytes) in rows {
            let vector = match Embedding::from_bytes(&bytes) {
                Ok(vector) => vector,
                Err(e) => {
                    tracing::warn!(fragment_id = %fragment_id, "Skipping unreadable vector: {}", e);
                    continue;
                }
            };
            hits.push(SearchHit {
                fragment_id: parse_uuid(&fragment_id)?,
                evidence_id: parse_uuid(&evidence_id)?,
                content,
                score: query.cosine(&vector),
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.fragment_id.cmp(&b.fragment_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_fragments(&self, fragment_ids: &[Uuid]) -> EmbeddingResult<usize> {
        if fragment_ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM fragment_embeddings WHERE fragment_id IN (");
        let mut ids = builder.separated(", ");
        for id in fragment_ids {
            ids.push_bind(id.to_string());
        }
        builder.push(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or_default())
    }

    async fn delete_evidence(&self, evidence_id: Uuid) -> EmbeddingResult<usize> {
        let result = sqlx::query("DELETE FROM fragment_embeddings WHERE evidence_id = ?")
            .bind(evidence_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or_default())
    }

    async fn delete_engagement(&self, engagement_id: Uuid) -> EmbeddingResult<usize> {
        let result = sqlx::query("DELETE FROM fragment_embeddings WHERE engagement_id = ?")
            .bind(engagement_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or_default())
    }
}

fn parse_uuid(raw: &str) -> EmbeddingResult<Uuid> {
    raw.parse()
        .map_err(|_| EmbeddingError::InvalidResponse(format!("invalid uuid in vector store: {raw}")))
}
