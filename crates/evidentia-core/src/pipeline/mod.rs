mod orchestrator;
mod retention;
mod state;

pub use orchestrator::{IngestError, IngestPipeline, IngestResult, IngestStatus, IngestSummary, StageError};
pub use retention::{PurgeReport, Retention};
pub use state::{resume_from, PipelineState, Stage, StageFailure, TransitionError};
