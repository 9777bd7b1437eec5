use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use uuid::Uuid;

use evidentia_core::ingest::RuleBasedExtractor;
use evidentia_core::{Classification, IngestError, IngestPipeline, PipelineConfig, Upload};

pub struct IngestOptions {
    pub engagement: Uuid,
    pub content_type: Option<String>,
    pub classification: Classification,
    pub batch: Option<Uuid>,
    pub seed_terms: Vec<String>,
}

#[derive(Serialize)]
struct IngestFailure<'a> {
    file: &'a str,
    error: String,
    retryable: bool,
    stage: Option<&'static str>,
}

async fn open(config: PipelineConfig) -> Result<IngestPipeline> {
    let data_dir = config.data_dir.clone();
    IngestPipeline::open(config)
        .await
        .with_context(|| format!("failed to open pipeline at {}", data_dir.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn ingest(config: PipelineConfig, options: &IngestOptions, files: &[PathBuf]) -> Result<()> {
    let remote_extraction = config.extraction_url.is_some();
    let mut pipeline = open(config).await?;
    if !options.seed_terms.is_empty() {
        if remote_extraction {
            tracing::warn!("Seed terms only apply to rule-based extraction; ignoring them");
        } else {
            let extractor = RuleBasedExtractor::default().with_seed_terms(&options.seed_terms);
            pipeline = pipeline.with_extractor(Arc::new(extractor));
        }
    }

    let mut failed = 0;
    for path in files {
        let name = file_name(path);
        let mut upload = Upload::new(options.engagement, name.clone())
            .with_classification(options.classification);
        if let Some(content_type) = &options.content_type {
            upload = upload.with_content_type(content_type.clone());
        }
        if let Some(batch) = options.batch {
            upload = upload.with_batch(batch);
        }

        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", path.display(), e);
                continue;
            }
        };
        let size = file.metadata().await.ok().map(|m| m.len());

        match pipeline.ingest_reader(&upload, file, size).await {
            Ok(summary) => print_json(&summary)?,
            Err(e) => {
                failed += 1;
                report_failure(&name, &e)?;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} file(s) failed", files.len());
    }
    Ok(())
}

fn report_failure(file: &str, error: &IngestError) -> Result<()> {
    tracing::debug!("Ingestion of {} failed: {}", file, error);
    let failure = IngestFailure {
        file,
        error: error.user_message(),
        retryable: error.is_retryable(),
        stage: error.stage().map(|s| s.as_str()),
    };
    eprintln!("{}", serde_json::to_string(&failure)?);
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.to_string_lossy().into_owned(),
        |n| n.to_string_lossy().into_owned(),
    )
}

pub async fn reprocess(config: PipelineConfig, evidence_id: Uuid) -> Result<()> {
    let pipeline = open(config).await?;
    match pipeline.reprocess(evidence_id).await {
        Ok(summary) => print_json(&summary),
        Err(e) => {
            report_failure(&evidence_id.to_string(), &e)?;
            bail!("reprocessing {evidence_id} failed");
        }
    }
}

pub async fn status(config: PipelineConfig, evidence_id: Uuid) -> Result<()> {
    let pipeline = open(config).await?;
    let item = pipeline
        .status(evidence_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    print_json(&item)
}

pub async fn list(config: PipelineConfig, engagement: Uuid) -> Result<()> {
    let pipeline = open(config).await?;
    let items = pipeline.storage().list_evidence(engagement).await?;
    print_json(&items)
}

pub async fn lineage(config: PipelineConfig, evidence_id: Uuid) -> Result<()> {
    let pipeline = open(config).await?;
    let records = pipeline.recorder().lineage(evidence_id).await?;
    print_json(&records)
}

pub async fn search(config: PipelineConfig, engagement: Uuid, query: &str, top_k: usize) -> Result<()> {
    let pipeline = open(config).await?;
    let hits = pipeline
        .search(engagement, query, top_k)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    print_json(&hits)
}

pub async fn purge(
    config: PipelineConfig,
    evidence_id: Option<Uuid>,
    engagement: Option<Uuid>,
) -> Result<()> {
    let pipeline = open(config).await?;
    let retention = pipeline.retention();
    let report = match (evidence_id, engagement) {
        (Some(id), _) => retention.purge_evidence(id).await,
        (None, Some(engagement)) => retention.purge_engagement(engagement).await,
        (None, None) => bail!("nothing to purge"),
    }
    .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    print_json(&report)
}

pub async fn audit(config: PipelineConfig, engagement: Uuid) -> Result<()> {
    let pipeline = open(config).await?;
    let trail = pipeline.recorder().audit_trail(engagement).await?;
    print_json(&trail)
}
