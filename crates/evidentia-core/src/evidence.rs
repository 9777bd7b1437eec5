use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::StorageHandle;
use crate::graph::GraphKeys;
use crate::pipeline::{Stage, StageFailure};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Valid,
    Rejected,
}

impl ValidationStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ValidationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "valid" => Ok(Self::Valid),
            "rejected" => Ok(Self::Rejected),
            _ => Err(crate::Error::invalid("validation_status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "confidential" => Ok(Self::Confidential),
            "restricted" => Ok(Self::Restricted),
            _ => Err(crate::Error::invalid("classification", s)),
        }
    }
}

/// Per-item tallies filled in as stages complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactCounts {
    pub fragments: usize,
    pub entities: usize,
    pub nodes: usize,
    pub relationships: usize,
    pub embeddings: usize,
    pub extraction_failures: usize,
    pub embedding_failures: usize,
    pub duplicate_candidates: usize,
}

/// One uploaded file within an engagement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: Uuid,
    pub engagement_id: Uuid,
    pub name: String,
    /// Hex SHA-256 of the raw upload.
    pub fingerprint: String,
    pub declared_type: Option<String>,
    pub detected_format: String,
    #[serde(skip)]
    pub(crate) storage: Option<StorageHandle>,
    pub size_bytes: u64,
    pub validation_status: ValidationStatus,
    pub classification: Classification,
    pub duplicate_of: Option<Uuid>,
    /// Last stage whose writes were committed.
    pub stage: Stage,
    pub failure: Option<StageFailure>,
    pub counts: ArtifactCounts,
    #[serde(skip)]
    pub(crate) graph_keys: Option<GraphKeys>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvidenceItem {
    pub(crate) fn new(
        engagement_id: Uuid,
        name: String,
        fingerprint: String,
        detected_format: String,
        size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            engagement_id,
            name,
            fingerprint,
            declared_type: None,
            detected_format,
            storage: None,
            size_bytes,
            validation_status: ValidationStatus::Valid,
            classification: Classification::default(),
            duplicate_of: None,
            stage: Stage::Validated,
            failure: None,
            counts: ArtifactCounts::default(),
            graph_keys: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    #[must_use]
    pub const fn has_blob(&self) -> bool {
        self.storage.is_some()
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.stage, Stage::Completed) && self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    Text,
    Table,
    ProcessElement,
    Relationship,
    Schema,
}

impl FragmentType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::ProcessElement => "process_element",
            Self::Relationship => "relationship",
            Self::Schema => "schema",
        }
    }
}

impl std::str::FromStr for FragmentType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "process_element" => Ok(Self::ProcessElement),
            "relationship" => Ok(Self::Relationship),
            "schema" => Ok(Self::Schema),
            _ => Err(crate::Error::invalid("fragment_type", s)),
        }
    }
}

/// Parser output before it is bound to an evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentDraft {
    pub fragment_type: FragmentType,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl FragmentDraft {
    #[must_use]
    pub const fn new(fragment_type: FragmentType, content: String) -> Self {
        Self {
            fragment_type,
            content,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(FragmentType::Text, content.into())
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFragment {
    pub id: Uuid,
    pub evidence_id: Uuid,
    pub ordinal: u32,
    pub fragment_type: FragmentType,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl EvidenceFragment {
    /// Fragment ids derive from the parent and position so that a re-parse
    /// produces the same ids.
    #[must_use]
    pub fn from_draft(evidence_id: Uuid, ordinal: u32, draft: FragmentDraft) -> Self {
        Self {
            id: Uuid::new_v5(&evidence_id, &ordinal.to_be_bytes()),
            evidence_id,
            ordinal,
            fragment_type: draft.fragment_type,
            content: draft.content,
            metadata: draft.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_ids_are_stable() {
        let evidence = Uuid::now_v7();
        let a = EvidenceFragment::from_draft(evidence, 3, FragmentDraft::text("one"));
        let b = EvidenceFragment::from_draft(evidence, 3, FragmentDraft::text("two"));
        let c = EvidenceFragment::from_draft(evidence, 4, FragmentDraft::text("one"));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_classification_defaults_to_internal() {
        assert_eq!(Classification::default(), Classification::Internal);
        assert_eq!(
            "Restricted".parse::<Classification>().unwrap(),
            Classification::Restricted
        );
    }

    #[test]
    fn test_new_item_starts_validated() {
        let item = EvidenceItem::new(
            Uuid::now_v7(),
            "notes.txt".into(),
            "ab".into(),
            "plain_text".into(),
            2,
        );
        assert_eq!(item.stage, Stage::Validated);
        assert_eq!(item.validation_status, ValidationStatus::Valid);
        assert!(!item.is_duplicate());
        assert!(!item.is_complete());
    }
}
