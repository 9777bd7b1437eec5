mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use evidentia_core::PipelineConfig;

const DEFAULT_FILTER: &str = "evidentia=info,evidentia_core=info";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(bytes) = cli.max_upload_bytes {
        config = config.with_max_upload_bytes(bytes);
    }

    dispatch(cli.command, config).await
}

async fn dispatch(command: Commands, config: PipelineConfig) -> Result<()> {
    match command {
        Commands::Ingest {
            engagement,
            content_type,
            classification,
            batch,
            seed_terms,
            files,
        } => {
            let options = commands::IngestOptions {
                engagement,
                content_type,
                classification,
                batch,
                seed_terms,
            };
            commands::ingest(config, &options, &files).await
        }
        Commands::Reprocess { evidence_id } => commands::reprocess(config, evidence_id).await,
        Commands::Status { evidence_id } => commands::status(config, evidence_id).await,
        Commands::List { engagement } => commands::list(config, engagement).await,
        Commands::Lineage { evidence_id } => commands::lineage(config, evidence_id).await,
        Commands::Search {
            engagement,
            top_k,
            query,
        } => commands::search(config, engagement, &query, top_k).await,
        Commands::Purge {
            evidence_id,
            engagement,
        } => commands::purge(config, evidence_id, engagement).await,
        Commands::Audit { engagement } => commands::audit(config, engagement).await,
    }
}
