use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityType;
use crate::relationship::RelationType;

/// Graph label: the evidence item itself or one of the entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NodeLabel {
    Evidence,
    Entity(EntityType),
}

impl NodeLabel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Evidence => "Evidence",
            Self::Entity(entity_type) => entity_type.label(),
        }
    }

    #[must_use]
    pub const fn entity_type(&self) -> Option<EntityType> {
        match self {
            Self::Evidence => None,
            Self::Entity(entity_type) => Some(*entity_type),
        }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeLabel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("evidence") {
            return Ok(Self::Evidence);
        }
        EntityType::from_str(s).map(Self::Entity)
    }
}

impl From<NodeLabel> for String {
    fn from(label: NodeLabel) -> Self {
        label.as_str().to_string()
    }
}

impl TryFrom<String> for NodeLabel {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: String,
    pub label: NodeLabel,
    pub engagement_id: Uuid,
    pub evidence_id: Uuid,
    pub name: String,
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub key: String,
    pub relation: RelationType,
    pub source: String,
    pub target: String,
    pub engagement_id: Uuid,
    pub evidence_id: Uuid,
    pub properties: serde_json::Value,
}

impl GraphRelationship {
    /// Key derived from the relation and its endpoints. Symmetric relations
    /// order their endpoints first so both directions share one key.
    #[must_use]
    pub fn stable_key(evidence_id: Uuid, relation: RelationType, source: &str, target: &str) -> String {
        let (a, b) = if relation.is_symmetric() && target < source {
            (target, source)
        } else {
            (source, target)
        };
        Uuid::new_v5(&evidence_id, format!("{}:{a}:{b}", relation.as_str()).as_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for label in [NodeLabel::Evidence, NodeLabel::Entity(EntityType::System)] {
            let parsed: NodeLabel = label.as_str().parse().unwrap();
            assert_eq!(parsed, label);
        }
        assert_eq!(NodeLabel::Entity(EntityType::Role).to_string(), "Role");
        assert!("Widget".parse::<NodeLabel>().is_err());
    }

    #[test]
    fn test_label_serializes_as_string() {
        let json = serde_json::to_string(&NodeLabel::Entity(EntityType::Activity)).unwrap();
        assert_eq!(json, "\"Activity\"");
    }

    #[test]
    fn test_symmetric_key_ignores_direction() {
        let evidence = Uuid::now_v7();
        let forward = GraphRelationship::stable_key(evidence, RelationType::CoOccursWith, "a", "b");
        let backward = GraphRelationship::stable_key(evidence, RelationType::CoOccursWith, "b", "a");
        assert_eq!(forward, backward);

        let uses = GraphRelationship::stable_key(evidence, RelationType::Uses, "a", "b");
        let used_by = GraphRelationship::stable_key(evidence, RelationType::Uses, "b", "a");
        assert_ne!(uses, used_by);
    }
}
