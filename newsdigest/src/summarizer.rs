use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use common::SummarizerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cleaning;
use crate::llm::{LlmProvider, LlmRequest};

/// `AI News Update <YYYY MM DD>.md`
pub fn deliverable_file_name(date: NaiveDate) -> String {
    format!("AI News Update {}.md", date.format("%Y %m %d"))
}

pub fn render_deliverable(summary: &str, abstracts: &str, date: NaiveDate) -> String {
    format!(
        "# AI News Update - {}\n\n## Weekly Summary\n\n{}\n\n---\n\n## News Abstracts\n\n{}",
        date.format("%Y/%m/%d"),
        summary,
        abstracts
    )
}

/// Single synthesis call with a fixed retry budget
pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    prompt: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, prompt: impl Into<String>, config: &SummarizerConfig) -> Self {
        Self {
            provider,
            prompt: prompt.into(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// Errors only once every attempt has failed.
    pub async fn summarize(&self, abstracts: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let request = LlmRequest::with_system(self.prompt.as_str(), abstracts);
            match self.provider.generate(request).await {
                Ok(response) => return Ok(response.content),
                Err(e) => {
                    warn!("Error calling API: {:#}, retry {}/{}", e, attempt, self.max_attempts);
                    last_error = Some(e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }

        error!("Max retries reached, giving up.");
        Err(last_error
            .unwrap_or_else(|| anyhow!("no attempts made"))
            .context(format!("summary generation failed after {} attempts", self.max_attempts)))
    }
}

/// Summarize `input` and write the dated deliverable; returns its path.
pub async fn run(
    provider: Arc<dyn LlmProvider>,
    config: &SummarizerConfig,
    input: &Path,
    output: Option<PathBuf>,
) -> Result<PathBuf> {
    let mut abstracts = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("input file '{}' does not exist or cannot be read", input.display()))?;

    if config.clean_abstracts {
        let cleaned = cleaning::clean_abstracts(&abstracts);
        info!(
            kept = cleaned.kept,
            skipped = cleaned.skipped,
            duplicates = cleaned.duplicates,
            "Cleaned abstracts"
        );
        abstracts = cleaned.text;
    }

    let prompt = tokio::fs::read_to_string(&config.prompt_path)
        .await
        .with_context(|| format!("Failed to read system prompt: {}", config.prompt_path.display()))?;

    info!("Generating summary...");
    let summary = Summarizer::new(provider, prompt, config).summarize(&abstracts).await?;

    let today = Local::now().date_naive();
    let output = match output {
        Some(path) => path,
        None => config.deliverable_dir.join(deliverable_file_name(today)),
    };
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create deliverable directory: {}", parent.display()))?;
    }

    tokio::fs::write(&output, render_deliverable(&summary, &abstracts, today))
        .await
        .with_context(|| format!("Failed to write deliverable: {}", output.display()))?;

    info!("Deliverable saved to {}", output.display());
    Ok(output)
}
