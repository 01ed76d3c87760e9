use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use common::AbstractorConfig;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::llm::{LlmProvider, LlmRequest};
use crate::rate_limit::RateLimiter;

/// An article that produced no abstract
#[derive(Debug, Clone)]
pub struct ArticleFailure {
    /// 0-based manifest position
    pub index: usize,
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one abstractor run; `fragments` are in completion order.
#[derive(Debug, Default)]
pub struct AbstractReport {
    pub total: usize,
    pub fragments: Vec<(usize, String)>,
    pub failures: Vec<ArticleFailure>,
}

impl AbstractReport {
    pub fn succeeded(&self) -> usize {
        self.fragments.len()
    }

    /// Fragments in manifest order, joined by a blank line.
    pub fn merged(&self) -> String {
        merge_fragments(self.fragments.clone())
    }
}

/// Sort by manifest index, drop empty fragments, join with a blank line.
pub fn merge_fragments(mut fragments: Vec<(usize, String)>) -> String {
    fragments.sort_by_key(|(idx, _)| *idx);
    fragments
        .iter()
        .map(|(_, text)| text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Clean up a model answer: unwrap a surrounding code fence and drop any
/// preamble before the first heading marker.
pub fn normalize_fragment(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        text = match rest.trim_end().strip_suffix("```") {
            Some(body) => body.strip_suffix('\n').unwrap_or(body),
            None => rest,
        };
    }

    if let Some(pos) = text.find('#') {
        if !text.trim_start().starts_with('#') {
            text = &text[pos..];
        }
    }

    text.trim().to_string()
}

/// Manifest paths in order; blank lines are ignored.
pub async fn read_manifest(path: &Path) -> Result<Vec<PathBuf>> {
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Input file {} does not exist or cannot be read", path.display()))?;
    Ok(body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// `abstract_md/abstract_md_<YYYYmmdd_HHMMSS>.md`
pub fn default_output_path(output_dir: &Path, now: DateTime<Local>) -> PathBuf {
    output_dir.join(format!("abstract_md_{}.md", now.format("%Y%m%d_%H%M%S")))
}

struct WorkerContext {
    provider: Arc<dyn LlmProvider>,
    prompt: Arc<str>,
    limiter: Arc<RateLimiter>,
    max_attempts: u32,
    retry_delay: Duration,
}

/// Batch coordinator: owns the rate limiter and hands it to each worker.
pub struct Abstractor {
    ctx: Arc<WorkerContext>,
    batch_size: usize,
}

impl Abstractor {
    pub fn new(provider: Arc<dyn LlmProvider>, prompt: impl Into<Arc<str>>, config: &AbstractorConfig) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                provider,
                prompt: prompt.into(),
                limiter: Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
                max_attempts: config.max_attempts.max(1),
                retry_delay: config.retry_delay,
            }),
            batch_size: config.max_workers.max(1),
        }
    }

    /// Abstract every article. Batches run one after another; articles inside a
    /// batch run concurrently.
    pub async fn process(&self, paths: &[PathBuf]) -> AbstractReport {
        let total = paths.len();
        let total_batches = (total + self.batch_size - 1) / self.batch_size;
        info!(
            "Starting: {} articles in {} batches ({} per batch)",
            total, total_batches, self.batch_size
        );

        let mut report = AbstractReport { total, ..AbstractReport::default() };

        for (batch_no, batch) in paths.chunks(self.batch_size).enumerate() {
            let offset = batch_no * self.batch_size;
            info!(
                "Processing batch {} with {} articles, {} batches remaining",
                batch_no + 1,
                batch.len(),
                total_batches - batch_no - 1
            );

            let mut pending: BTreeSet<usize> = (offset..offset + batch.len()).collect();
            let mut set = JoinSet::new();
            for (i, path) in batch.iter().enumerate() {
                let ctx = self.ctx.clone();
                let path = path.clone();
                let index = offset + i;
                set.spawn(async move {
                    let outcome = abstract_article(&ctx, index, &path).await;
                    (index, path, outcome)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, _, Ok(text))) => {
                        pending.remove(&index);
                        report.fragments.push((index, text));
                    }
                    Ok((index, path, Err(e))) => {
                        pending.remove(&index);
                        error!("Article#{}: {:#}", index, e);
                        report.failures.push(ArticleFailure { index, path, error: format!("{:#}", e) });
                    }
                    Err(e) => error!("abstract worker task failed: {}", e),
                }
            }

            // tasks that panicked never reported back
            for index in pending {
                report.failures.push(ArticleFailure {
                    index,
                    path: paths[index].clone(),
                    error: "worker task aborted".to_string(),
                });
            }

            info!("Batch {} complete", batch_no + 1);
        }

        report
    }
}

async fn abstract_article(ctx: &WorkerContext, index: usize, path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read article file {}", path.display()))?;

    let mut last_error = None;
    for attempt in 1..=ctx.max_attempts {
        ctx.limiter.acquire().await;

        let request = LlmRequest::with_system(&*ctx.prompt, content.as_str());
        match ctx.provider.generate(request).await {
            Ok(response) => return Ok(normalize_fragment(&response.content)),
            Err(e) => {
                warn!(
                    "Article#{}: API call failed: {:#}, retrying ({}/{})...",
                    index, e, attempt, ctx.max_attempts
                );
                last_error = Some(e);
                if attempt < ctx.max_attempts {
                    tokio::time::sleep(ctx.retry_delay).await;
                } else {
                    warn!("Article#{}: max retries reached, giving up on this article", index);
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no attempts made"))
        .context(format!("failed after {} attempts", ctx.max_attempts)))
}

/// Read the manifest, abstract each article and write the merged document.
/// Returns `None` when nothing usable came back.
pub async fn run(
    provider: Arc<dyn LlmProvider>,
    config: &AbstractorConfig,
    manifest: &Path,
    output: Option<PathBuf>,
) -> Result<Option<PathBuf>> {
    let prompt = tokio::fs::read_to_string(&config.prompt_path)
        .await
        .with_context(|| format!("Failed to read system prompt: {}", config.prompt_path.display()))?;
    let paths = read_manifest(manifest).await?;

    let report = Abstractor::new(provider, prompt, config).process(&paths).await;
    info!(
        "All done: processed {}/{} articles successfully",
        report.succeeded(),
        report.total
    );

    let merged = report.merged();
    if merged.is_empty() {
        warn!("No valid content was produced; no file written.");
        return Ok(None);
    }

    let output = output.unwrap_or_else(|| default_output_path(&config.output_dir, Local::now()));
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    tokio::fs::write(&output, merged)
        .await
        .with_context(|| format!("Failed to write file: {}", output.display()))?;

    info!("Markdown file generated: {}", output.display());
    Ok(Some(output))
}
