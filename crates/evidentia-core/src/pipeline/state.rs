use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validated,
    Parsed,
    Extracted,
    GraphWritten,
    EmbeddingsWritten,
    Completed,
    Duplicate,
}

impl Stage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Parsed => "parsed",
            Self::Extracted => "extracted",
            Self::GraphWritten => "graph_written",
            Self::EmbeddingsWritten => "embeddings_written",
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
        }
    }

    /// Successor on the processing path. `Duplicate` branches off
    /// `Validated` and is never a successor.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::Validated),
            Self::Validated => Some(Self::Parsed),
            Self::Parsed => Some(Self::Extracted),
            Self::Extracted => Some(Self::GraphWritten),
            Self::GraphWritten => Some(Self::EmbeddingsWritten),
            Self::EmbeddingsWritten => Some(Self::Completed),
            Self::Completed | Self::Duplicate => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Duplicate)
    }

    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        self.next() == Some(to) || (*self == Self::Validated && to == Self::Duplicate)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "validated" => Ok(Self::Validated),
            "parsed" => Ok(Self::Parsed),
            "extracted" => Ok(Self::Extracted),
            "graph_written" => Ok(Self::GraphWritten),
            "embeddings_written" => Ok(Self::EmbeddingsWritten),
            "completed" => Ok(Self::Completed),
            "duplicate" => Ok(Self::Duplicate),
            _ => Err(crate::Error::InvalidStage(s.to_string())),
        }
    }
}

/// The stage that was being attempted when processing stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move from {from} to {to}")]
    Invalid { from: Stage, to: Stage },
    #[error("pipeline already terminated")]
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    At { stage: Stage },
    Failed(StageFailure),
}

impl PipelineState {
    #[must_use]
    pub const fn at(stage: Stage) -> Self {
        Self::At { stage }
    }

    pub fn advance(&mut self, to: Stage) -> Result<(), TransitionError> {
        match self {
            Self::Failed(_) => Err(TransitionError::Terminated),
            Self::At { stage } if stage.is_terminal() => Err(TransitionError::Terminated),
            Self::At { stage } if stage.can_transition_to(to) => {
                *stage = to;
                Ok(())
            }
            Self::At { stage } => Err(TransitionError::Invalid { from: *stage, to }),
        }
    }

    /// Moves to `Failed`, naming the stage that was in progress.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<StageFailure, TransitionError> {
        let Self::At { stage } = self else {
            return Err(TransitionError::Terminated);
        };
        let Some(attempted) = stage.next() else {
            return Err(TransitionError::Terminated);
        };

        let failure = StageFailure {
            stage: attempted,
            reason: reason.into(),
        };
        *self = Self::Failed(failure.clone());
        Ok(failure)
    }

    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::At { stage } => Some(*stage),
            Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::At { stage } => stage.is_terminal(),
            Self::Failed(_) => true,
        }
    }
}

/// First stage to run when re-entering an item whose last committed stage
/// is `committed`. Completed items are rebuilt from their stored fragments.
#[must_use]
pub const fn resume_from(committed: Stage) -> Option<Stage> {
    match committed {
        Stage::Duplicate => None,
        Stage::Completed => Some(Stage::Extracted),
        other => other.next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_advances_in_order() {
        let mut state = PipelineState::at(Stage::Received);
        for stage in [
            Stage::Validated,
            Stage::Parsed,
            Stage::Extracted,
            Stage::GraphWritten,
            Stage::EmbeddingsWritten,
            Stage::Completed,
        ] {
            state.advance(stage).unwrap();
        }
        assert!(state.is_terminal());
        assert_eq!(state.stage(), Some(Stage::Completed));
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut state = PipelineState::at(Stage::Parsed);
        assert_eq!(
            state.advance(Stage::GraphWritten),
            Err(TransitionError::Invalid {
                from: Stage::Parsed,
                to: Stage::GraphWritten
            })
        );
        assert_eq!(state.stage(), Some(Stage::Parsed));
    }

    #[test]
    fn duplicate_only_from_validated() {
        let mut state = PipelineState::at(Stage::Validated);
        state.advance(Stage::Duplicate).unwrap();
        assert!(state.is_terminal());

        let mut state = PipelineState::at(Stage::Parsed);
        assert!(state.advance(Stage::Duplicate).is_err());
    }

    #[test]
    fn failure_names_attempted_stage() {
        let mut state = PipelineState::at(Stage::Extracted);
        let failure = state.fail("graph store unavailable").unwrap();
        assert_eq!(failure.stage, Stage::GraphWritten);
        assert!(state.is_terminal());
        assert_eq!(state.advance(Stage::GraphWritten), Err(TransitionError::Terminated));
    }

    #[test]
    fn terminal_states_cannot_fail() {
        let mut state = PipelineState::at(Stage::Duplicate);
        assert!(state.fail("late").is_err());
    }

    #[test]
    fn resume_points() {
        assert_eq!(resume_from(Stage::Validated), Some(Stage::Parsed));
        assert_eq!(resume_from(Stage::Extracted), Some(Stage::GraphWritten));
        assert_eq!(resume_from(Stage::Completed), Some(Stage::Extracted));
        assert_eq!(resume_from(Stage::Duplicate), None);
    }
}
