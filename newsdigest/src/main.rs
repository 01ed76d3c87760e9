/*
newsdigest - single-binary main.rs
Each pipeline stage is a subcommand; `run` chains them through the files they write.
*/

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use common::{
    AbstractorConfig, ExtractorConfig, LlmConfig, LlmStage, PublishTarget, Settings, SourceConfig,
    SourceOverrides, SummarizerConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newsdigest::extraction::{self, ExtractionRun, TimeWindow};
use newsdigest::llm::remote::RemoteLlmProvider;
use newsdigest::llm::LlmProvider;
use newsdigest::{abstractor, publisher, summarizer};

#[derive(Parser, Debug)]
#[command(name = "newsdigest", about = "Weekly news digest: extract, abstract, summarize, publish")]
struct Cli {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the articles of a time window as text files plus a manifest
    Extract(ExtractArgs),
    /// Abstract every article listed in a manifest into one Markdown file
    Abstract {
        /// Manifest produced by `extract`
        manifest: PathBuf,
        /// Output Markdown file (default: abstract_md/abstract_md_<timestamp>.md)
        output: Option<PathBuf>,
    },
    /// Synthesize the weekly summary and write the deliverable
    Summarize(SummarizeArgs),
    /// Upload files to the configured destination
    Publish {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run every stage in order
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct ExtractArgs {
    /// Path to the FreshRSS SQLite database (overrides DB_PATH)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Time window in hours
    #[arg(long, default_value_t = 168)]
    hours: u32,

    /// End hour of day (0-23) for the window end
    #[arg(long, default_value_t = 17, value_parser = clap::value_parser!(u32).range(0..=23))]
    end_hour: u32,

    /// Force API mode even if DB_PATH is set
    #[arg(long)]
    api: bool,

    /// Directory that receives the `articles_<timestamp>` run directory
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    /// Merged abstracts Markdown file
    #[arg(long = "input-md", short = 'i')]
    input_md: PathBuf,

    /// Deliverable path (default: deliverable/AI News Update <date>.md)
    #[arg(long = "output-md", short = 'o')]
    output_md: Option<PathBuf>,

    /// Drop skipped and duplicate abstracts before summarizing
    #[arg(long)]
    clean: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    extract: ExtractArgs,

    /// Drop skipped and duplicate abstracts before summarizing
    #[arg(long)]
    clean: bool,

    /// Stop after writing the deliverable
    #[arg(long)]
    no_publish: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let settings = match load_settings(cli.config.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    let result = match cli.command {
        Command::Extract(args) => extract(&settings, &args).await.map(|run| {
            if let Some(run) = run {
                println!("{}", run.manifest.display());
            }
        }),
        Command::Abstract { manifest, output } => abstract_articles(&settings, &manifest, output)
            .await
            .map(|written| {
                if let Some(path) = written {
                    println!("{}", path.display());
                }
            }),
        Command::Summarize(args) => summarize(&settings, &args.input_md, args.output_md, args.clean)
            .await
            .map(|path| println!("{}", path.display())),
        Command::Publish { files } => publish(&settings, &files).await,
        Command::Run(args) => run_pipeline(&settings, &args).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// `config.default.toml`, then `--config` (must exist) or `config.toml`, then `.env` and the environment.
async fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = match config {
        Some(p) => {
            if !p.exists() {
                anyhow::bail!("Config file not found: {}", p.display());
            }
            Some(p.to_path_buf())
        }
        None => Some(PathBuf::from("config.toml")).filter(|p| p.exists()),
    };

    let settings = Settings::load(Some(default_path.as_path()), override_path.as_deref()).await?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(settings)
}

fn llm_provider(settings: &Settings, stage: LlmStage) -> Result<Arc<dyn LlmProvider>> {
    let config = LlmConfig::for_stage(settings, stage)?;
    let provider = RemoteLlmProvider::from_config(&config);
    info!(stage = ?stage, model = provider.model(), "LLM provider initialized");
    Ok(Arc::new(provider))
}

fn source_for(settings: &Settings, args: &ExtractArgs) -> Result<SourceConfig> {
    let overrides = SourceOverrides {
        db_path: args.db.clone(),
        force_api: args.api,
    };
    SourceConfig::resolve(settings, &overrides)
}

fn extractor_config(settings: &Settings, args: &ExtractArgs) -> ExtractorConfig {
    let mut config = ExtractorConfig::from_settings(settings);
    if let Some(dir) = &args.output_dir {
        config.base_dir = dir.clone();
    }
    config
}

async fn extract_with(source: &SourceConfig, config: &ExtractorConfig, args: &ExtractArgs) -> Result<Option<ExtractionRun>> {
    let window = TimeWindow::ending_at_hour(&Local::now(), args.hours, args.end_hour)?;
    extraction::run(source, config, &window).await
}

async fn extract(settings: &Settings, args: &ExtractArgs) -> Result<Option<ExtractionRun>> {
    let source = source_for(settings, args)?;
    extract_with(&source, &extractor_config(settings, args), args).await
}

async fn abstract_articles(settings: &Settings, manifest: &Path, output: Option<PathBuf>) -> Result<Option<PathBuf>> {
    let provider = llm_provider(settings, LlmStage::Abstract)?;
    let config = AbstractorConfig::from_settings(settings);
    abstractor::run(provider, &config, manifest, output).await
}

async fn summarize(settings: &Settings, input: &Path, output: Option<PathBuf>, clean: bool) -> Result<PathBuf> {
    let provider = llm_provider(settings, LlmStage::Summary)?;
    let mut config = SummarizerConfig::from_settings(settings);
    config.clean_abstracts |= clean;
    summarizer::run(provider, &config, input, output).await
}

async fn publish(settings: &Settings, files: &[PathBuf]) -> Result<()> {
    let target = PublishTarget::resolve(settings)?;
    publisher::publish(&target, files).await?;
    Ok(())
}

/// All stages in order. Every configuration is validated before the first request.
async fn run_pipeline(settings: &Settings, args: &RunArgs) -> Result<()> {
    let source = source_for(settings, &args.extract)?;
    let extractor = extractor_config(settings, &args.extract);
    let abstract_llm = llm_provider(settings, LlmStage::Abstract)?;
    let abstract_config = AbstractorConfig::from_settings(settings);
    let summary_llm = llm_provider(settings, LlmStage::Summary)?;
    let mut summary_config = SummarizerConfig::from_settings(settings);
    summary_config.clean_abstracts |= args.clean;
    let target = if args.no_publish {
        None
    } else {
        Some(PublishTarget::resolve(settings)?)
    };

    let Some(run) = extract_with(&source, &extractor, &args.extract).await? else {
        info!("Nothing to digest; stopping.");
        return Ok(());
    };

    let Some(abstracts) = abstractor::run(abstract_llm, &abstract_config, &run.manifest, None).await? else {
        warn!("No abstracts produced; stopping before summary.");
        return Ok(());
    };

    let deliverable = summarizer::run(summary_llm, &summary_config, &abstracts, None)
        .await
        .context("summary stage failed")?;

    match target {
        Some(target) => {
            publisher::publish(&target, &[deliverable]).await?;
        }
        None => info!("Publishing disabled; deliverable at {}", deliverable.display()),
    }
    Ok(())
}
