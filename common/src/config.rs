//! Typed per-stage configuration, validated from `Settings` before any network call.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::Settings;

/// Which pipeline stage an LLM client is built for. Each stage has its own model
/// key and built-in default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmStage {
    Abstract,  // per-article abstracts (fast model)
    Summary,   // weekly synthesis (strong model)
}

impl LlmStage {
    fn model_key(self) -> &'static str {
        match self {
            LlmStage::Abstract => "LLM_ABSTRACT_MODEL",
            LlmStage::Summary => "LLM_SUMMARY_MODEL",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            LlmStage::Abstract => "gemini-2.5-flash",
            LlmStage::Summary => "gemini-2.5-pro",
        }
    }
}

/// OpenAI-compatible endpoint settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
}

impl LlmConfig {
    pub fn for_stage(settings: &Settings, stage: LlmStage) -> Result<Self> {
        let missing = settings.missing(&["LLM_API_KEY", "LLM_BASE_URL"]);
        if !missing.is_empty() {
            bail!("Missing environment variables for the LLM client: {}", missing.join(", "));
        }

        let model = settings
            .first_of(&[stage.model_key(), "LLM_MODEL"])
            .unwrap_or(stage.default_model())
            .to_string();

        Ok(Self {
            api_key: settings.require("LLM_API_KEY")?.to_string(),
            base_url: settings.require("LLM_BASE_URL")?.to_string(),
            model,
            timeout_seconds: settings.parse_or("LLM_TIMEOUT_SECONDS", 120),
            temperature: 0.5,
        })
    }
}

/// Command-line inputs that take part in data-source selection.
#[derive(Debug, Clone, Default)]
pub struct SourceOverrides {
    /// `--db`, wins over `DB_PATH`
    pub db_path: Option<PathBuf>,
    /// `--api`, forces the reader API even when a database is configured
    pub force_api: bool,
}

/// Where the extractor reads articles from. Resolved once at startup.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Database(DatabaseSourceConfig),
    ReaderApi(ReaderApiConfig),
}

#[derive(Debug, Clone)]
pub struct DatabaseSourceConfig {
    pub path: PathBuf,
    pub allowed_feed_names: Vec<String>,
    /// Feeds in this category are also included when their URL contains `extra_url_contains`.
    pub extra_category_id: i64,
    pub extra_url_contains: String,
}

#[derive(Debug, Clone)]
pub struct ReaderApiConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub categories: Vec<String>,
    pub exclude_feeds: Vec<String>,
}

impl SourceConfig {
    /// Explicit override > source-specific signal > first configured source.
    pub fn resolve(settings: &Settings, overrides: &SourceOverrides) -> Result<Self> {
        let api_url = settings.get("FRESHRSS_API_URL");
        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| settings.get("DB_PATH").map(PathBuf::from));

        if overrides.force_api || (api_url.is_some() && db_path.is_none()) {
            return Ok(SourceConfig::ReaderApi(ReaderApiConfig::from_settings(settings)?));
        }

        match db_path {
            Some(path) => Ok(SourceConfig::Database(DatabaseSourceConfig::from_settings(settings, path)?)),
            None => bail!(
                "No data source configured. Set FRESHRSS_API_URL for API mode, or DB_PATH/--db for SQLite mode."
            ),
        }
    }
}

impl DatabaseSourceConfig {
    fn from_settings(settings: &Settings, path: PathBuf) -> Result<Self> {
        if settings.get("ALLOWED_FEED_NAMES").is_none() {
            bail!("ALLOWED_FEED_NAMES must be set for SQLite mode.");
        }
        let allowed_feed_names = settings.list("ALLOWED_FEED_NAMES");
        if allowed_feed_names.is_empty() {
            bail!("ALLOWED_FEED_NAMES resulted in empty list.");
        }

        let extra_category_id = match settings.get("DB_EXTRA_CATEGORY_ID") {
            Some(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("DB_EXTRA_CATEGORY_ID must be an integer, got '{}'", raw))?,
            None => 0,
        };

        Ok(Self {
            path,
            allowed_feed_names,
            extra_category_id,
            extra_url_contains: settings
                .get("DB_EXTRA_URL_CONTAINS")
                .unwrap_or("wechat")
                .to_string(),
        })
    }
}

impl ReaderApiConfig {
    fn from_settings(settings: &Settings) -> Result<Self> {
        let missing = settings.missing(&[
            "FRESHRSS_API_URL",
            "FRESHRSS_API_USER",
            "FRESHRSS_API_PASSWORD",
            "FRESHRSS_API_CATEGORY",
        ]);
        if !missing.is_empty() {
            bail!("Missing environment variables for API mode: {}", missing.join(", "));
        }

        let categories = settings.list("FRESHRSS_API_CATEGORY");
        if categories.is_empty() {
            bail!("FRESHRSS_API_CATEGORY resulted in empty list.");
        }

        Ok(Self {
            base_url: settings.require("FRESHRSS_API_URL")?.to_string(),
            user: settings.require("FRESHRSS_API_USER")?.to_string(),
            password: settings.require("FRESHRSS_API_PASSWORD")?.to_string(),
            categories,
            exclude_feeds: settings.list("FRESHRSS_API_EXCLUDE_FEEDS"),
        })
    }
}

/// Output location and article file formatting for the extractor
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub base_dir: PathBuf,
    pub date_format: String,
}

impl ExtractorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_dir: PathBuf::from(settings.get("ARTICLES_DIR").unwrap_or("articles")),
            date_format: settings
                .get("ARTICLE_DATE_FORMAT")
                .unwrap_or("%Y年%m月%d日")
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbstractorConfig {
    /// Concurrent workers; also the batch size.
    pub max_workers: usize,
    pub rate_limit_per_minute: u32,
    pub prompt_path: PathBuf,
    pub output_dir: PathBuf,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl AbstractorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_workers: settings.parse_or("ABSTRACT_MAX_WORKERS", 20usize).max(1),
            rate_limit_per_minute: settings.parse_or("ABSTRACT_RATE_LIMIT_PER_MINUTE", 1000u32).max(1),
            prompt_path: PathBuf::from(
                settings
                    .get("ABSTRACT_PROMPT_PATH")
                    .unwrap_or("system_prompt/abstract_prompt.md"),
            ),
            output_dir: PathBuf::from(settings.get("ABSTRACT_OUTPUT_DIR").unwrap_or("abstract_md")),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub prompt_path: PathBuf,
    pub clean_abstracts: bool,
    pub deliverable_dir: PathBuf,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl SummarizerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            prompt_path: PathBuf::from(
                settings
                    .get("SUMMARY_PROMPT_PATH")
                    .unwrap_or("system_prompt/summary_prompt.md"),
            ),
            clean_abstracts: settings.flag("SUMMARY_CLEAN_ABSTRACTS"),
            deliverable_dir: PathBuf::from(settings.get("DELIVERABLE_DIR").unwrap_or("deliverable")),
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Upload destination. Resolved once at startup; the two strategies never mix.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    SyncTool(SyncToolConfig),
    Dropbox(DropboxConfig),
}

#[derive(Debug, Clone)]
pub struct SyncToolConfig {
    pub md_dest: Option<String>,
    pub pdf_dest: Option<String>,
    /// Executable invoked as `<binary> copyto <src> <dest>`
    pub binary: String,
}

#[derive(Debug, Clone)]
pub struct DropboxConfig {
    pub app_key: String,
    pub app_secret: String,
    pub refresh_token: String,
}

impl PublishTarget {
    pub fn resolve(settings: &Settings) -> Result<Self> {
        let md_dest = settings.get("RCLONE_MD_DEST").map(String::from);
        let pdf_dest = settings.get("RCLONE_PDF_DEST").map(String::from);

        if md_dest.is_some() || pdf_dest.is_some() {
            return Ok(PublishTarget::SyncTool(SyncToolConfig {
                md_dest,
                pdf_dest,
                binary: settings.get("RCLONE_BIN").unwrap_or("rclone").to_string(),
            }));
        }

        let missing = settings.missing(&["DROPBOX_APP_KEY", "DROPBOX_APP_SECRET", "DROPBOX_REFRESH_TOKEN"]);
        if !missing.is_empty() {
            bail!(
                "Either configure RCLONE_MD_DEST/RCLONE_PDF_DEST for rclone, or DROPBOX_APP_KEY, \
                 DROPBOX_APP_SECRET, and DROPBOX_REFRESH_TOKEN for Dropbox API (missing: {}).",
                missing.join(", ")
            );
        }

        Ok(PublishTarget::Dropbox(DropboxConfig {
            app_key: settings.require("DROPBOX_APP_KEY")?.to_string(),
            app_secret: settings.require("DROPBOX_APP_SECRET")?.to_string(),
            refresh_token: settings.require("DROPBOX_REFRESH_TOKEN")?.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_settings() -> Vec<(&'static str, &'static str)> {
        vec![
            ("FRESHRSS_API_URL", "https://rss.example.com/api/greader.php"),
            ("FRESHRSS_API_USER", "reader"),
            ("FRESHRSS_API_PASSWORD", "secret"),
            ("FRESHRSS_API_CATEGORY", "AI, Research"),
        ]
    }

    #[test]
    fn llm_model_falls_back_through_tiers() {
        let base = [("LLM_API_KEY", "k"), ("LLM_BASE_URL", "https://llm.example.com/v1")];

        let settings = Settings::from_pairs(base);
        assert_eq!(LlmConfig::for_stage(&settings, LlmStage::Abstract).unwrap().model, "gemini-2.5-flash");
        assert_eq!(LlmConfig::for_stage(&settings, LlmStage::Summary).unwrap().model, "gemini-2.5-pro");

        let mut settings = Settings::from_pairs(base);
        settings.set("LLM_MODEL", "shared");
        assert_eq!(LlmConfig::for_stage(&settings, LlmStage::Summary).unwrap().model, "shared");

        settings.set("LLM_SUMMARY_MODEL", "big");
        assert_eq!(LlmConfig::for_stage(&settings, LlmStage::Summary).unwrap().model, "big");
        assert_eq!(LlmConfig::for_stage(&settings, LlmStage::Abstract).unwrap().model, "shared");
    }

    #[test]
    fn llm_reports_all_missing_keys() {
        let err = LlmConfig::for_stage(&Settings::default(), LlmStage::Abstract).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("LLM_API_KEY"));
        assert!(msg.contains("LLM_BASE_URL"));
    }

    #[test]
    fn api_url_without_db_selects_reader_api() {
        let settings = Settings::from_pairs(api_settings());
        let source = SourceConfig::resolve(&settings, &SourceOverrides::default()).unwrap();
        match source {
            SourceConfig::ReaderApi(cfg) => assert_eq!(cfg.categories, vec!["AI", "Research"]),
            other => panic!("expected reader api, got {:?}", other),
        }
    }

    #[test]
    fn db_path_wins_over_api_url_unless_forced() {
        let mut pairs = api_settings();
        pairs.push(("DB_PATH", "/data/freshrss.db"));
        pairs.push(("ALLOWED_FEED_NAMES", "Feed A,Feed B"));
        let settings = Settings::from_pairs(pairs);

        let source = SourceConfig::resolve(&settings, &SourceOverrides::default()).unwrap();
        assert!(matches!(source, SourceConfig::Database(ref db) if db.allowed_feed_names.len() == 2));

        let forced = SourceOverrides { db_path: None, force_api: true };
        let source = SourceConfig::resolve(&settings, &forced).unwrap();
        assert!(matches!(source, SourceConfig::ReaderApi(_)));
    }

    #[test]
    fn cli_db_path_overrides_env() {
        let settings = Settings::from_pairs([("DB_PATH", "/env.db"), ("ALLOWED_FEED_NAMES", "A")]);
        let overrides = SourceOverrides { db_path: Some(PathBuf::from("/cli.db")), force_api: false };
        match SourceConfig::resolve(&settings, &overrides).unwrap() {
            SourceConfig::Database(db) => {
                assert_eq!(db.path, PathBuf::from("/cli.db"));
                assert_eq!(db.extra_category_id, 0);
                assert_eq!(db.extra_url_contains, "wechat");
            }
            other => panic!("expected database, got {:?}", other),
        }
    }

    #[test]
    fn no_source_is_an_error() {
        let err = SourceConfig::resolve(&Settings::default(), &SourceOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("No data source configured"));
    }

    #[test]
    fn database_requires_allowed_feeds() {
        let settings = Settings::from_pairs([("DB_PATH", "/x.db"), ("ALLOWED_FEED_NAMES", " , ")]);
        let err = SourceConfig::resolve(&settings, &SourceOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("empty list"));
    }

    #[test]
    fn forced_api_lists_missing_variables() {
        let settings = Settings::from_pairs([("FRESHRSS_API_URL", "https://rss.example.com")]);
        let forced = SourceOverrides { db_path: None, force_api: true };
        let msg = SourceConfig::resolve(&settings, &forced).unwrap_err().to_string();
        assert!(msg.contains("FRESHRSS_API_USER"));
        assert!(msg.contains("FRESHRSS_API_PASSWORD"));
        assert!(msg.contains("FRESHRSS_API_CATEGORY"));
        assert!(!msg.contains("FRESHRSS_API_URL,"));
    }

    #[test]
    fn sync_tool_takes_precedence_over_dropbox() {
        let settings = Settings::from_pairs([
            ("RCLONE_PDF_DEST", "remote:pdf"),
            ("DROPBOX_APP_KEY", "k"),
            ("DROPBOX_APP_SECRET", "s"),
            ("DROPBOX_REFRESH_TOKEN", "t"),
        ]);
        match PublishTarget::resolve(&settings).unwrap() {
            PublishTarget::SyncTool(cfg) => {
                assert_eq!(cfg.md_dest, None);
                assert_eq!(cfg.pdf_dest.as_deref(), Some("remote:pdf"));
                assert_eq!(cfg.binary, "rclone");
            }
            other => panic!("expected sync tool, got {:?}", other),
        }
    }

    #[test]
    fn dropbox_requires_all_credentials() {
        let settings = Settings::from_pairs([("DROPBOX_APP_KEY", "k")]);
        let msg = PublishTarget::resolve(&settings).unwrap_err().to_string();
        assert!(msg.contains("DROPBOX_APP_SECRET"));
        assert!(msg.contains("DROPBOX_REFRESH_TOKEN"));
    }

    #[test]
    fn abstractor_workers_clamp_to_one() {
        let settings = Settings::from_pairs([("ABSTRACT_MAX_WORKERS", "0")]);
        let cfg = AbstractorConfig::from_settings(&settings);
        assert_eq!(cfg.max_workers, 1);
        assert_eq!(cfg.rate_limit_per_minute, 1000);
        assert_eq!(cfg.max_attempts, 3);
    }
}
