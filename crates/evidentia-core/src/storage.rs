use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::{
    blob::StorageHandle,
    evidence::{EvidenceFragment, EvidenceItem},
    lineage::{AuditEntry, LineageRecord},
    Error, Result,
};

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS evidence_items (
    id TEXT PRIMARY KEY,
    engagement_id TEXT NOT NULL,
    name TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    declared_type TEXT,
    detected_format TEXT NOT NULL,
    storage_handle TEXT,
    size_bytes INTEGER NOT NULL,
    validation_status TEXT NOT NULL,
    classification TEXT NOT NULL,
    duplicate_of TEXT REFERENCES evidence_items(id) ON DELETE CASCADE,
    stage TEXT NOT NULL,
    failure TEXT,
    counts TEXT NOT NULL,
    graph_keys TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evidence_engagement ON evidence_items(engagement_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_evidence_original
    ON evidence_items(engagement_id, fingerprint) WHERE duplicate_of IS NULL;

CREATE TABLE IF NOT EXISTS evidence_fragments (
    id TEXT PRIMARY KEY,
    evidence_id TEXT NOT NULL REFERENCES evidence_items(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    fragment_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_fragments_position ON evidence_fragments(evidence_id, ordinal);

CREATE TABLE IF NOT EXISTS lineage_records (
    id TEXT PRIMARY KEY,
    evidence_id TEXT NOT NULL REFERENCES evidence_items(id) ON DELETE CASCADE,
    engagement_id TEXT NOT NULL,
    batch_id TEXT,
    node_keys TEXT NOT NULL,
    relationship_keys TEXT NOT NULL,
    embedded_fragment_ids TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lineage_evidence ON lineage_records(evidence_id);

CREATE TRIGGER IF NOT EXISTS lineage_records_no_update BEFORE UPDATE ON lineage_records BEGIN
    SELECT RAISE(ABORT, 'lineage records are append-only');
END;

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    engagement_id TEXT NOT NULL,
    evidence_id TEXT,
    action TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_engagement ON audit_log(engagement_id, created_at);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;
";

const EVIDENCE_COLUMNS: &str = "id, engagement_id, name, fingerprint, declared_type, \
    detected_format, storage_handle, size_bytes, validation_status, classification, \
    duplicate_of, stage, failure, counts, graph_keys, created_at, updated_at";

const FRAGMENT_BATCH_ROWS: usize = 500;

/// Relational store for evidence items, fragments, lineage and audit.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        Self::connect(&format!("sqlite:{path}?mode=rwc")).await
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Shared pool for stores co-located in the same database.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // Evidence operations

    pub async fn insert_evidence(&self, item: &EvidenceItem) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO evidence_items ({EVIDENCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(item.id.to_string())
        .bind(item.engagement_id.to_string())
        .bind(&item.name)
        .bind(&item.fingerprint)
        .bind(&item.declared_type)
        .bind(&item.detected_format)
        .bind(item.storage.as_ref().map(|h| h.as_str().to_string()))
        .bind(i64::try_from(item.size_bytes).unwrap_or(i64::MAX))
        .bind(item.validation_status.as_str())
        .bind(item.classification.as_str())
        .bind(item.duplicate_of.map(|id| id.to_string()))
        .bind(item.stage.as_str())
        .bind(item.failure.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&item.counts)?)
        .bind(item.graph_keys.as_ref().map(serde_json::to_string).transpose()?)
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::DuplicateFingerprint {
                    engagement_id: item.engagement_id,
                    fingerprint: item.fingerprint.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The non-duplicate item holding `fingerprint` in this engagement.
    pub async fn find_original(
        &self,
        engagement_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<EvidenceItem>> {
        let row = sqlx::query(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence_items \
             WHERE engagement_id = ? AND fingerprint = ? AND duplicate_of IS NULL"
        ))
        .bind(engagement_id.to_string())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_evidence_row).transpose()
    }

    pub async fn get_evidence(&self, id: Uuid) -> Result<EvidenceItem> {
        let row = sqlx::query(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence_items WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::EvidenceNotFound(id))?;

        parse_evidence_row(&row)
    }

    pub async fn list_evidence(&self, engagement_id: Uuid) -> Result<Vec<EvidenceItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence_items \
             WHERE engagement_id = ? ORDER BY created_at, id"
        ))
        .bind(engagement_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_evidence_row).collect()
    }

    /// Persists the mutable processing fields of `item`.
    pub async fn save_progress(&self, item: &EvidenceItem) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE evidence_items
            SET validation_status = ?, stage = ?, failure = ?, counts = ?, graph_keys = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(item.validation_status.as_str())
        .bind(item.stage.as_str())
        .bind(item.failure.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&item.counts)?)
        .bind(item.graph_keys.as_ref().map(serde_json::to_string).transpose()?)
        .bind(Utc::now().to_rfc3339())
        .bind(item.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::EvidenceNotFound(item.id));
        }

        Ok(())
    }

    pub async fn delete_evidence(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM evidence_items WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::EvidenceNotFound(id));
        }

        Ok(())
    }

    // Fragment operations

    /// Replaces all fragments of an item with `fragments` in one transaction.
    pub async fn replace_fragments(
        &self,
        evidence_id: Uuid,
        fragments: &[EvidenceFragment],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM evidence_fragments WHERE evidence_id = ?")
            .bind(evidence_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in fragments.chunks(FRAGMENT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO evidence_fragments (id, evidence_id, ordinal, fragment_type, content, metadata) ",
            );
            builder.push_values(chunk, |mut row, fragment| {
                row.push_bind(fragment.id.to_string())
                    .push_bind(fragment.evidence_id.to_string())
                    .push_bind(i64::from(fragment.ordinal))
                    .push_bind(fragment.fragment_type.as_str())
                    .push_bind(&fragment.content)
                    .push_bind(fragment.metadata.to_string());
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_fragments(&self, evidence_id: Uuid) -> Result<Vec<EvidenceFragment>> {
        let rows: Vec<(String, String, i64, String, String, String)> = sqlx::query_as(
            r"
            SELECT id, evidence_id, ordinal, fragment_type, content, metadata
            FROM evidence_fragments WHERE evidence_id = ? ORDER BY ordinal
            ",
        )
        .bind(evidence_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_fragment_row).collect()
    }

    pub async fn count_fragments(&self, evidence_id: Uuid) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM evidence_fragments WHERE evidence_id = ?")
                .bind(evidence_id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(usize::try_from(count).unwrap_or_default())
    }

    // Lineage and audit operations

    /// Writes the lineage record, its audit entry and the final progress of
    /// `item` atomically.
    pub async fn complete_evidence(
        &self,
        item: &EvidenceItem,
        lineage: &LineageRecord,
        audit: &AuditEntry,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO lineage_records
                (id, evidence_id, engagement_id, batch_id, node_keys, relationship_keys, embedded_fragment_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(lineage.id.to_string())
        .bind(lineage.evidence_id.to_string())
        .bind(lineage.engagement_id.to_string())
        .bind(lineage.batch_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&lineage.node_keys)?)
        .bind(serde_json::to_string(&lineage.relationship_keys)?)
        .bind(serde_json::to_string(&lineage.embedded_fragment_ids)?)
        .bind(lineage.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;

        sqlx::query("UPDATE evidence_items SET stage = ?, failure = NULL, counts = ?, updated_at = ? WHERE id = ?")
            .bind(item.stage.as_str())
            .bind(serde_json::to_string(&item.counts)?)
            .bind(Utc::now().to_rfc3339())
            .bind(item.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn lineage(&self, evidence_id: Uuid) -> Result<Vec<LineageRecord>> {
        let rows: Vec<(String, String, String, Option<String>, String, String, String, String)> =
            sqlx::query_as(
                r"
                SELECT id, evidence_id, engagement_id, batch_id, node_keys, relationship_keys, embedded_fragment_ids, created_at
                FROM lineage_records WHERE evidence_id = ? ORDER BY created_at
                ",
            )
            .bind(evidence_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(parse_lineage_row).collect()
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_audit(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_audit(&self, engagement_id: Uuid) -> Result<Vec<AuditEntry>> {
        let rows: Vec<(String, String, Option<String>, String, String, String)> = sqlx::query_as(
            r"
            SELECT id, engagement_id, evidence_id, action, details, created_at
            FROM audit_log WHERE engagement_id = ? ORDER BY created_at, id
            ",
        )
        .bind(engagement_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_audit_row).collect()
    }
}

async fn insert_audit(tx: &mut sqlx::Transaction<'_, Sqlite>, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO audit_log (id, engagement_id, evidence_id, action, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(entry.id.to_string())
    .bind(entry.engagement_id.to_string())
    .bind(entry.evidence_id.map(|id| id.to_string()))
    .bind(entry.action.as_str())
    .bind(entry.details.to_string())
    .bind(entry.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn parse_uuid(field: &'static str, raw: &str) -> Result<Uuid> {
    raw.parse().map_err(|_| Error::invalid(field, raw))
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::invalid(field, raw))
}

fn parse_evidence_row(row: &SqliteRow) -> Result<EvidenceItem> {
    let id: String = row.try_get("id")?;
    let engagement_id: String = row.try_get("engagement_id")?;
    let storage: Option<String> = row.try_get("storage_handle")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let validation_status: String = row.try_get("validation_status")?;
    let classification: String = row.try_get("classification")?;
    let duplicate_of: Option<String> = row.try_get("duplicate_of")?;
    let stage: String = row.try_get("stage")?;
    let failure: Option<String> = row.try_get("failure")?;
    let counts: String = row.try_get("counts")?;
    let graph_keys: Option<String> = row.try_get("graph_keys")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(EvidenceItem {
        id: parse_uuid("evidence id", &id)?,
        engagement_id: parse_uuid("engagement id", &engagement_id)?,
        name: row.try_get("name")?,
        fingerprint: row.try_get("fingerprint")?,
        declared_type: row.try_get("declared_type")?,
        detected_format: row.try_get("detected_format")?,
        storage: storage.map(StorageHandle::from_stored).transpose()?,
        size_bytes: u64::try_from(size_bytes).unwrap_or_default(),
        validation_status: validation_status.parse()?,
        classification: classification.parse()?,
        duplicate_of: duplicate_of
            .map(|raw| parse_uuid("duplicate_of", &raw))
            .transpose()?,
        stage: stage.parse()?,
        failure: failure.map(|raw| serde_json::from_str(&raw)).transpose()?,
        counts: serde_json::from_str(&counts)?,
        graph_keys: graph_keys.map(|raw| serde_json::from_str(&raw)).transpose()?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_fragment_row(
    row: (String, String, i64, String, String, String),
) -> Result<EvidenceFragment> {
    let (id, evidence_id, ordinal, fragment_type, content, metadata) = row;

    Ok(EvidenceFragment {
        id: parse_uuid("fragment id", &id)?,
        evidence_id: parse_uuid("evidence id", &evidence_id)?,
        ordinal: u32::try_from(ordinal).map_err(|_| Error::invalid("ordinal", ordinal.to_string()))?,
        fragment_type: fragment_type.parse()?,
        content,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn parse_lineage_row(
    row: (String, String, String, Option<String>, String, String, String, String),
) -> Result<LineageRecord> {
    let (id, evidence_id, engagement_id, batch_id, nodes, relationships, fragments, created_at) =
        row;

    Ok(LineageRecord {
        id: parse_uuid("lineage id", &id)?,
        evidence_id: parse_uuid("evidence id", &evidence_id)?,
        engagement_id: parse_uuid("engagement id", &engagement_id)?,
        batch_id: batch_id.map(|raw| parse_uuid("batch id", &raw)).transpose()?,
        node_keys: serde_json::from_str(&nodes)?,
        relationship_keys: serde_json::from_str(&relationships)?,
        embedded_fragment_ids: serde_json::from_str(&fragments)?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

fn parse_audit_row(
    row: (String, String, Option<String>, String, String, String),
) -> Result<AuditEntry> {
    let (id, engagement_id, evidence_id, action, details, created_at) = row;

    Ok(AuditEntry {
        id: parse_uuid("audit id", &id)?,
        engagement_id: parse_uuid("engagement id", &engagement_id)?,
        evidence_id: evidence_id
            .map(|raw| parse_uuid("evidence id", &raw))
            .transpose()?,
        action: action.parse()?,
        details: serde_json::from_str(&details)?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
