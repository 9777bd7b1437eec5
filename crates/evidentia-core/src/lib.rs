pub mod blob;
pub mod config;
pub mod embedding;
pub mod entity;
pub mod error;
pub mod evidence;
pub mod graph;
pub mod ingest;
pub mod lineage;
pub mod pipeline;
pub mod relationship;
pub mod storage;

pub use blob::{BlobStore, FsBlobStore};
pub use config::PipelineConfig;
pub use embedding::{Embedder, Embedding, HashEmbedder, SqliteVectorStore, VectorStore, EMBEDDING_DIM};
pub use entity::EntityType;
pub use error::{Error, Result};
pub use evidence::{Classification, EvidenceFragment, EvidenceItem, FragmentType, ValidationStatus};
pub use graph::{GraphStore, MemoryGraphStore, SqliteGraphStore};
pub use ingest::{Upload, ValidationError};
pub use lineage::{AuditAction, AuditEntry, LineageRecord};
pub use pipeline::{IngestError, IngestPipeline, IngestStatus, IngestSummary, Stage};
pub use relationship::RelationType;
pub use storage::Storage;
