use serde::{Deserialize, Serialize};

use crate::entity::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    // Provenance
    SupportedBy,

    // Inferred from shared fragments
    CoOccursWith,

    // Semantic bridges
    OwnedBy,
    Uses,
    Requires,
    GovernedBy,
}

impl RelationType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SupportedBy => "SUPPORTED_BY",
            Self::CoOccursWith => "CO_OCCURS_WITH",
            Self::OwnedBy => "OWNED_BY",
            Self::Uses => "USES",
            Self::Requires => "REQUIRES",
            Self::GovernedBy => "GOVERNED_BY",
        }
    }

    #[must_use]
    pub const fn is_symmetric(&self) -> bool {
        matches!(self, Self::CoOccursWith)
    }

    #[must_use]
    pub const fn is_inferred(&self) -> bool {
        !matches!(self, Self::SupportedBy)
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPPORTED_BY" => Ok(Self::SupportedBy),
            "CO_OCCURS_WITH" => Ok(Self::CoOccursWith),
            "OWNED_BY" => Ok(Self::OwnedBy),
            "USES" => Ok(Self::Uses),
            "REQUIRES" => Ok(Self::Requires),
            "GOVERNED_BY" => Ok(Self::GovernedBy),
            _ => Err(crate::Error::InvalidRelationshipType(s.to_string())),
        }
    }
}

/// A domain rule linking every entity of `source` type to every entity of
/// `target` type found in the same evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemanticBridge {
    pub source: EntityType,
    pub target: EntityType,
    pub relation: RelationType,
}

pub const SEMANTIC_BRIDGES: &[SemanticBridge] = &[
    SemanticBridge {
        source: EntityType::Activity,
        target: EntityType::Role,
        relation: RelationType::OwnedBy,
    },
    SemanticBridge {
        source: EntityType::Activity,
        target: EntityType::System,
        relation: RelationType::Uses,
    },
    SemanticBridge {
        source: EntityType::Decision,
        target: EntityType::Activity,
        relation: RelationType::Requires,
    },
    SemanticBridge {
        source: EntityType::Activity,
        target: EntityType::Document,
        relation: RelationType::GovernedBy,
    },
];
