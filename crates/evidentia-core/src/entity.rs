use serde::{Deserialize, Serialize};

/// Closed vocabulary of entity kinds the extractors may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Activity,
    Decision,
    Role,
    System,
    Document,
}

impl EntityType {
    pub const ALL: [Self; 5] = [
        Self::Activity,
        Self::Decision,
        Self::Role,
        Self::System,
        Self::Document,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Decision => "decision",
            Self::Role => "role",
            Self::System => "system",
            Self::Document => "document",
        }
    }

    /// Graph node label for entities of this type.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Activity => "Activity",
            Self::Decision => "Decision",
            Self::Role => "Role",
            Self::System => "System",
            Self::Document => "Document",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "activity" => Ok(Self::Activity),
            "decision" => Ok(Self::Decision),
            "role" => Ok(Self::Role),
            "system" => Ok(Self::System),
            "document" => Ok(Self::Document),
            _ => Err(crate::Error::InvalidEntityType(s.to_string())),
        }
    }
}
