//! Article extraction: pull entries for a time window from the aggregator and
//! write them as numbered text files plus a manifest.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Timelike};
use common::{ExtractorConfig, SourceConfig};
use scraper::Html;
use std::fmt::{Display, Write as _};
use std::path::{Path, PathBuf};
use tracing::info;

pub mod database;
pub mod reader_api;

/// File name of the manifest inside each run directory
pub const MANIFEST_FILE: &str = "successful_articles.txt";

/// One aggregator entry, as fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub link: String,
    pub title: String,
    /// Raw (HTML) content
    pub content: String,
    /// Seconds since epoch
    pub published: i64,
    pub feed_name: String,
}

/// Inclusive `[start_ts, end_ts]` window in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl TimeWindow {
    /// The window ends at the last `end_hour:00` that is not in the future
    /// (today if `now` is at or past that hour, else yesterday) and spans `hours` back.
    pub fn ending_at_hour<Tz: TimeZone>(now: &DateTime<Tz>, hours: u32, end_hour: u32) -> Result<Self> {
        if end_hour > 23 {
            anyhow::bail!("end hour must be between 0 and 23, got {}", end_hour);
        }

        let today = now.date_naive();
        let end_day = if now.hour() >= end_hour {
            today
        } else {
            today.pred_opt().context("date underflow computing window end")?
        };

        let naive_end = end_day
            .and_hms_opt(end_hour, 0, 0)
            .context("invalid window end time")?;
        let tz = now.timezone();
        let end = tz
            .from_local_datetime(&naive_end)
            .earliest()
            .with_context(|| format!("window end {} does not exist in local time", naive_end))?;
        // hours are counted on the wall clock, so a DST change shifts the span by its offset
        let naive_start = naive_end - chrono::Duration::hours(i64::from(hours));
        let start = tz
            .from_local_datetime(&naive_start)
            .earliest()
            .with_context(|| format!("window start {} does not exist in local time", naive_start))?;

        Ok(Self {
            start_ts: start.timestamp(),
            end_ts: end.timestamp(),
        })
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start_ts <= ts && ts <= self.end_ts
    }
}

/// Text content of an HTML fragment: all text nodes concatenated, trimmed.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect();
    text.trim().to_string()
}

/// Render an article file in local time.
pub fn render_article(article: &Article, date_format: &str) -> String {
    render_article_in(article, date_format, &Local)
}

/// `link`, `title`, `feed date` and body, separated by blank lines.
pub fn render_article_in<Tz>(article: &Article, date_format: &str, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let date = format_date(article.published, date_format, tz);
    format!(
        "{}\n\n{}\n\n{} {}\n\n{}",
        article.link,
        article.title,
        article.feed_name,
        date,
        html_to_text(&article.content)
    )
}

fn format_date<Tz>(ts: i64, date_format: &str, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let Some(dt) = tz.timestamp_opt(ts, 0).single() else {
        return ts.to_string();
    };
    let mut out = String::new();
    // an invalid format string surfaces as fmt::Error here
    if write!(out, "{}", dt.format(date_format)).is_err() {
        return ts.to_string();
    }
    out
}

/// Paths produced by one extraction run
#[derive(Debug, Clone)]
pub struct ExtractionRun {
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub article_files: Vec<PathBuf>,
}

/// Write `article_<n>.txt` files (n from 1, in the given order) and the manifest
/// under `base_dir/articles_<YYYYmmdd_HHMM>`.
pub async fn write_run(
    articles: &[Article],
    base_dir: &Path,
    date_format: &str,
    started_at: DateTime<Local>,
) -> Result<ExtractionRun> {
    let dir = base_dir.join(format!("articles_{}", started_at.format("%Y%m%d_%H%M")));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let mut manifest_body = String::new();
    let mut article_files = Vec::with_capacity(articles.len());

    for (idx, article) in articles.iter().enumerate() {
        let path = dir.join(format!("article_{}.txt", idx + 1));
        tokio::fs::write(&path, render_article(article, date_format))
            .await
            .with_context(|| format!("Failed to write article file: {}", path.display()))?;
        manifest_body.push_str(&path.to_string_lossy());
        manifest_body.push('\n');
        article_files.push(path);
    }

    let manifest = dir.join(MANIFEST_FILE);
    tokio::fs::write(&manifest, manifest_body)
        .await
        .with_context(|| format!("Failed to write manifest: {}", manifest.display()))?;

    Ok(ExtractionRun { dir, manifest, article_files })
}

/// Fetch from whichever source was selected at startup.
pub async fn fetch_articles(source: &SourceConfig, window: &TimeWindow) -> Result<Vec<Article>> {
    match source {
        SourceConfig::Database(cfg) => {
            info!(path = %cfg.path.display(), "Using SQLite mode");
            database::fetch_articles(cfg, window).await
        }
        SourceConfig::ReaderApi(cfg) => {
            info!(url = %cfg.base_url, "Using API mode");
            reader_api::fetch_articles(cfg, window).await
        }
    }
}

/// Extract the window into a new run directory. `None` when the window is empty.
pub async fn run(
    source: &SourceConfig,
    config: &ExtractorConfig,
    window: &TimeWindow,
) -> Result<Option<ExtractionRun>> {
    info!(
        start_ts = window.start_ts,
        end_ts = window.end_ts,
        "Extracting entries from {} to {}",
        Local.timestamp_opt(window.start_ts, 0).single().map(|d| d.to_string()).unwrap_or_default(),
        Local.timestamp_opt(window.end_ts, 0).single().map(|d| d.to_string()).unwrap_or_default()
    );

    let articles = fetch_articles(source, window).await?;
    if articles.is_empty() {
        info!("No entries found in the specified time window.");
        return Ok(None);
    }

    let run = write_run(&articles, &config.base_dir, &config.date_format, Local::now()).await?;
    info!(
        "Extracted {} articles. List file: {}",
        run.article_files.len(),
        run.manifest.display()
    );
    Ok(Some(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn window_ends_today_once_end_hour_has_passed() {
        let now = utc(2026, 3, 10, 18, 30);
        let window = TimeWindow::ending_at_hour(&now, 168, 17).unwrap();
        assert_eq!(window.end_ts, utc(2026, 3, 10, 17, 0).timestamp());
        assert_eq!(window.start_ts, utc(2026, 3, 3, 17, 0).timestamp());
    }

    #[test]
    fn window_ends_yesterday_before_end_hour() {
        let now = utc(2026, 3, 10, 9, 15);
        let window = TimeWindow::ending_at_hour(&now, 24, 17).unwrap();
        assert_eq!(window.end_ts, utc(2026, 3, 9, 17, 0).timestamp());
        assert_eq!(window.start_ts, utc(2026, 3, 8, 17, 0).timestamp());
    }

    /// UTC+1 until 2024-03-31 02:00 local, UTC+2 from 03:00.
    #[derive(Debug, Clone, Copy)]
    struct SpringForward;

    impl SpringForward {
        fn transition() -> chrono::NaiveDateTime {
            chrono::NaiveDate::from_ymd_opt(2024, 3, 31)
                .unwrap()
                .and_hms_opt(1, 0, 0)
                .unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = chrono::FixedOffset;

        fn from_offset(_: &chrono::FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, _: &chrono::NaiveDate) -> chrono::LocalResult<chrono::FixedOffset> {
            chrono::LocalResult::Single(chrono::FixedOffset::east_opt(3600).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &chrono::NaiveDateTime) -> chrono::LocalResult<chrono::FixedOffset> {
            let winter = Self::transition() + chrono::Duration::hours(1);
            let summer = Self::transition() + chrono::Duration::hours(2);
            if *local < winter {
                chrono::LocalResult::Single(chrono::FixedOffset::east_opt(3600).unwrap())
            } else if *local >= summer {
                chrono::LocalResult::Single(chrono::FixedOffset::east_opt(7200).unwrap())
            } else {
                chrono::LocalResult::None
            }
        }

        fn offset_from_utc_date(&self, _: &chrono::NaiveDate) -> chrono::FixedOffset {
            chrono::FixedOffset::east_opt(3600).unwrap()
        }

        fn offset_from_utc_datetime(&self, utc: &chrono::NaiveDateTime) -> chrono::FixedOffset {
            let secs = if *utc < Self::transition() { 3600 } else { 7200 };
            chrono::FixedOffset::east_opt(secs).unwrap()
        }
    }

    #[test]
    fn window_hours_count_wall_clock_across_dst() {
        let now = SpringForward
            .from_local_datetime(
                &chrono::NaiveDate::from_ymd_opt(2024, 4, 1)
                    .unwrap()
                    .and_hms_opt(18, 0, 0)
                    .unwrap(),
            )
            .single()
            .unwrap();
        let window = TimeWindow::ending_at_hour(&now, 48, 17).unwrap();

        // 2024-04-01 17:00 +02:00 and 2024-03-30 17:00 +01:00
        assert_eq!(window.end_ts, utc(2024, 4, 1, 15, 0).timestamp());
        assert_eq!(window.start_ts, utc(2024, 3, 30, 16, 0).timestamp());
        assert_eq!(window.end_ts - window.start_ts, 47 * 3600);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = TimeWindow { start_ts: 100, end_ts: 200 };
        assert!(window.contains(100));
        assert!(window.contains(200));
        assert!(!window.contains(99));
        assert!(!window.contains(201));
    }

    #[test]
    fn invalid_end_hour_is_rejected() {
        assert!(TimeWindow::ending_at_hour(&Utc::now(), 24, 24).is_err());
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<p>Hello <b>world</b> &amp; friends</p>\n<div>second</div>  ";
        assert_eq!(html_to_text(html), "Hello world & friends\nsecond");
        assert_eq!(html_to_text(""), "");
    }

    #[test]
    fn article_file_layout() {
        let article = Article {
            link: "https://example.com/a".into(),
            title: "A title".into(),
            content: "<p>Body text</p>".into(),
            published: utc(2026, 1, 5, 8, 0).timestamp(),
            feed_name: "Example Feed".into(),
        };
        let rendered = render_article_in(&article, "%Y-%m-%d", &Utc);
        assert_eq!(
            rendered,
            "https://example.com/a\n\nA title\n\nExample Feed 2026-01-05\n\nBody text"
        );
        // rendering is a pure function of the article
        assert_eq!(rendered, render_article_in(&article, "%Y-%m-%d", &Utc));
    }

    #[test]
    fn bad_date_format_falls_back_to_timestamp() {
        let article = Article {
            link: String::new(),
            title: String::new(),
            content: String::new(),
            published: 1_700_000_000,
            feed_name: "F".into(),
        };
        let rendered = render_article_in(&article, "%Q", &Utc);
        assert!(rendered.contains("F 1700000000"));
    }

    #[tokio::test]
    async fn write_run_numbers_files_and_lists_them() {
        let dir = tempfile::tempdir().unwrap();
        let articles = vec![
            Article {
                link: "https://example.com/1".into(),
                title: "One".into(),
                content: "<p>first</p>".into(),
                published: 1_700_000_100,
                feed_name: "Feed".into(),
            },
            Article {
                link: "https://example.com/2".into(),
                title: "Two".into(),
                content: "second".into(),
                published: 1_700_000_000,
                feed_name: "Feed".into(),
            },
        ];
        let started = Local.with_ymd_and_hms(2026, 2, 1, 9, 5, 0).unwrap();

        let run = write_run(&articles, dir.path(), "%Y", started).await.unwrap();

        assert!(run.dir.ends_with("articles_20260201_0905"));
        let manifest = std::fs::read_to_string(&run.manifest).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("article_1.txt"));
        assert!(lines[1].ends_with("article_2.txt"));

        let first = std::fs::read_to_string(&run.article_files[0]).unwrap();
        assert!(first.starts_with("https://example.com/1\n\nOne\n\n"));
        assert!(first.ends_with("first"));

        // same input, fresh directory: identical bytes
        let again_dir = tempfile::tempdir().unwrap();
        let again = write_run(&articles, again_dir.path(), "%Y", started).await.unwrap();
        assert_eq!(
            std::fs::read(&run.article_files[1]).unwrap(),
            std::fs::read(&again.article_files[1]).unwrap()
        );
    }
}
