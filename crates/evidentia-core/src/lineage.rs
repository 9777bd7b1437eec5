use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::EvidenceItem;
use crate::storage::Storage;
use crate::Result;

/// Provenance of everything one evidence item wrote to the graph and
/// vector stores. Written once, after all other stages succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: Uuid,
    pub evidence_id: Uuid,
    pub engagement_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub node_keys: Vec<String>,
    pub relationship_keys: Vec<String>,
    pub embedded_fragment_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LineageRecord {
    #[must_use]
    pub fn new(
        item: &EvidenceItem,
        batch_id: Option<Uuid>,
        node_keys: Vec<String>,
        relationship_keys: Vec<String>,
        embedded_fragment_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            evidence_id: item.id,
            engagement_id: item.engagement_id,
            batch_id,
            node_keys,
            relationship_keys,
            embedded_fragment_ids,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    EvidenceUploaded,
    EvidenceDuplicate,
    EvidenceProcessed,
    EvidenceFailed,
    EvidenceReprocessed,
    EvidencePurged,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EvidenceUploaded => "EVIDENCE_UPLOADED",
            Self::EvidenceDuplicate => "EVIDENCE_DUPLICATE",
            Self::EvidenceProcessed => "EVIDENCE_PROCESSED",
            Self::EvidenceFailed => "EVIDENCE_FAILED",
            Self::EvidenceReprocessed => "EVIDENCE_REPROCESSED",
            Self::EvidencePurged => "EVIDENCE_PURGED",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "EVIDENCE_UPLOADED" => Ok(Self::EvidenceUploaded),
            "EVIDENCE_DUPLICATE" => Ok(Self::EvidenceDuplicate),
            "EVIDENCE_PROCESSED" => Ok(Self::EvidenceProcessed),
            "EVIDENCE_FAILED" => Ok(Self::EvidenceFailed),
            "EVIDENCE_REPROCESSED" => Ok(Self::EvidenceReprocessed),
            "EVIDENCE_PURGED" => Ok(Self::EvidencePurged),
            _ => Err(crate::Error::invalid("audit action", s)),
        }
    }
}

/// Immutable record that an action happened. Carries no foreign key so it
/// outlives the evidence it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub engagement_id: Uuid,
    pub evidence_id: Option<Uuid>,
    pub action: AuditAction,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        engagement_id: Uuid,
        evidence_id: Option<Uuid>,
        action: AuditAction,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            engagement_id,
            evidence_id,
            action,
            details,
            created_at: Utc::now(),
        }
    }

    /// Standard entry for an event about one evidence item.
    #[must_use]
    pub fn for_item(item: &EvidenceItem, action: AuditAction) -> Self {
        Self::new(
            item.engagement_id,
            Some(item.id),
            action,
            serde_json::json!({
                "evidence_id": item.id,
                "file_name": item.name,
                "content_hash": item.fingerprint,
                "is_duplicate": item.is_duplicate(),
            }),
        )
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !self.details.is_object() {
            self.details = serde_json::Value::Object(serde_json::Map::new());
        }
        if let serde_json::Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Writes lineage and audit entries through the relational store.
#[derive(Debug, Clone)]
pub struct LineageRecorder {
    storage: Storage,
}

impl LineageRecorder {
    #[must_use]
    pub const fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Final write for a processed item: lineage, audit and the `Completed`
    /// stage commit together.
    pub async fn record_completion(
        &self,
        item: &EvidenceItem,
        lineage: &LineageRecord,
        action: AuditAction,
    ) -> Result<()> {
        let audit = AuditEntry::for_item(item, action)
            .with_detail("lineage_id", lineage.id.to_string())
            .with_detail("node_count", lineage.node_keys.len())
            .with_detail("relationship_count", lineage.relationship_keys.len())
            .with_detail("embedding_count", lineage.embedded_fragment_ids.len());

        self.storage.complete_evidence(item, lineage, &audit).await
    }

    pub async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.storage.append_audit(entry).await
    }

    pub async fn lineage(&self, evidence_id: Uuid) -> Result<Vec<LineageRecord>> {
        self.storage.lineage(evidence_id).await
    }

    pub async fn audit_trail(&self, engagement_id: Uuid) -> Result<Vec<AuditEntry>> {
        self.storage.list_audit(engagement_id).await
    }
}
