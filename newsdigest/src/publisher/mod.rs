use anyhow::Result;
use common::PublishTarget;
use std::path::PathBuf;
use tracing::info;

pub mod dropbox;
pub mod sync_tool;

/// Per-file outcome of one publish run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub uploaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Upload `files` with the strategy chosen at startup. Only a failed Dropbox
/// connection is an error; per-file problems end up in the report.
pub async fn publish(target: &PublishTarget, files: &[PathBuf]) -> Result<PublishReport> {
    let report = match target {
        PublishTarget::SyncTool(cfg) => sync_tool::publish(cfg, files).await,
        PublishTarget::Dropbox(cfg) => dropbox::publish(cfg, files).await?,
    };

    info!(
        uploaded = report.uploaded.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Publish finished"
    );
    Ok(report)
}
