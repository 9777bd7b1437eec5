use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use evidentia_core::Classification;

#[derive(Parser)]
#[command(
    name = "evidentia",
    about = "Evidence ingestion into a knowledge graph and vector index",
    version
)]
pub struct Cli {
    /// Directory holding the database and blobs (overrides EVIDENTIA_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Upload size ceiling in bytes (overrides EVIDENTIA_MAX_UPLOAD_BYTES)
    #[arg(long, global = true)]
    pub max_upload_bytes: Option<u64>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate, store and process evidence files
    Ingest {
        /// Engagement the files belong to
        #[arg(long)]
        engagement: Uuid,
        /// Declared content type, applied to every file
        #[arg(long)]
        content_type: Option<String>,
        /// Sensitivity label (public, internal, confidential, restricted)
        #[arg(long, default_value = "internal")]
        classification: Classification,
        /// Upload batch the files belong to
        #[arg(long)]
        batch: Option<Uuid>,
        /// Engagement vocabulary that raises extraction confidence
        #[arg(long = "seed-term")]
        seed_terms: Vec<String>,
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Resume or rebuild processing for stored evidence
    Reprocess {
        evidence_id: Uuid,
    },
    /// Show the processing state of one evidence item
    Status {
        evidence_id: Uuid,
    },
    /// List evidence in an engagement
    List {
        #[arg(long)]
        engagement: Uuid,
    },
    /// Show lineage records for one evidence item
    Lineage {
        evidence_id: Uuid,
    },
    /// Find fragments similar to a query
    Search {
        #[arg(long)]
        engagement: Uuid,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        query: String,
    },
    /// Delete evidence and everything derived from it
    Purge {
        /// Evidence item to purge
        #[arg(required_unless_present = "engagement", conflicts_with = "engagement")]
        evidence_id: Option<Uuid>,
        /// Purge a whole engagement instead
        #[arg(long)]
        engagement: Option<Uuid>,
    },
    /// Print the audit trail of an engagement
    Audit {
        #[arg(long)]
        engagement: Uuid,
    },
}
