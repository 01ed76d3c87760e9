use anyhow::{anyhow, Context, Result};
use common::ReaderApiConfig;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::{Article, TimeWindow};

/// Items per page requested from the stream endpoint
const PAGE_SIZE: u32 = 1000;

/// The server filters on crawl time, not publish time, so the request starts
/// this far before the window and the exact filter is applied locally.
const FETCH_BUFFER_SECS: i64 = 2 * 24 * 3600;

/// Google Reader compatible API client (FreshRSS `greader.php`)
pub struct ReaderApiClient {
    base_url: String,
    client: Client,
}

impl ReaderApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("newsdigest/0.1.0")
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// `ClientLogin`; returns the `Auth=` token.
    pub async fn login(&self, user: &str, password: &str) -> Result<String> {
        let login_url = format!("{}/accounts/ClientLogin", self.base_url);
        let response = self
            .client
            .post(&login_url)
            .form(&[("Email", user), ("Passwd", password)])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("API login request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API login failed with status: {}", status);
        }

        let body = response.text().await.context("failed to read login response")?;
        body.trim()
            .lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(|token| token.trim().to_string())
            .context("API login failed: Auth token not found in response")
    }

    fn stream_url(&self, category: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid API URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("API URL cannot be used as a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(["reader", "api", "0", "stream", "contents", "user", "-", "label", category]);
        Ok(url)
    }

    async fn fetch_page(
        &self,
        url: &Url,
        auth_token: &str,
        ot: i64,
        continuation: Option<&str>,
    ) -> Result<StreamPage> {
        let mut request = self
            .client
            .get(url.clone())
            .header("Authorization", format!("GoogleLogin auth={}", auth_token))
            .query(&[("n", PAGE_SIZE.to_string()), ("ot", ot.to_string()), ("output", "json".to_string())])
            .timeout(Duration::from_secs(60));
        if let Some(c) = continuation {
            request = request.query(&[("c", c)]);
        }

        let response = request.send().await.context("API request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API request failed with status: {}", status);
        }
        response.json().await.context("API response parse failed")
    }

    /// All articles of one category inside the window, in server order.
    ///
    /// A failed page stops this category and returns what was collected so far.
    pub async fn category_articles(
        &self,
        auth_token: &str,
        category: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Article>> {
        let url = self.stream_url(category)?;
        let ot = window.start_ts - FETCH_BUFFER_SECS;
        let mut articles = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = match self.fetch_page(&url, auth_token, ot, continuation.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(category, "{:#}", e);
                    break;
                }
            };

            let items: Vec<Article> = page
                .items
                .unwrap_or_default()
                .into_iter()
                .map(StreamItem::into_article)
                .collect();
            let page_len = items.len();
            let all_after_window = items.iter().all(|a| a.published > window.end_ts);

            articles.extend(items.into_iter().filter(|a| window.contains(a.published)));

            match page.continuation {
                Some(c) if !c.is_empty() && page_len > 0 && !all_after_window => continuation = Some(c),
                _ => break,
            }
        }

        Ok(articles)
    }
}

/// Log in, read every configured category, drop excluded feeds and sort newest first.
pub async fn fetch_articles(cfg: &ReaderApiConfig, window: &TimeWindow) -> Result<Vec<Article>> {
    let client = ReaderApiClient::new(&cfg.base_url)?;

    info!("Authenticating with FreshRSS API at {}...", cfg.base_url);
    let auth_token = client
        .login(&cfg.user, &cfg.password)
        .await
        .context("Failed to authenticate with FreshRSS API")?;

    let mut all_articles = Vec::new();
    for category in &cfg.categories {
        info!("Fetching articles from category '{}'...", category);
        match client.category_articles(&auth_token, category, window).await {
            Ok(articles) => {
                info!("  Found {} articles in '{}'", articles.len(), category);
                all_articles.extend(articles);
            }
            Err(e) => warn!("Skipping category '{}': {:#}", category, e),
        }
    }

    let (mut all_articles, excluded) = exclude_feeds(all_articles, &cfg.exclude_feeds);
    if excluded > 0 {
        info!("Excluded {} articles from feeds: {}", excluded, cfg.exclude_feeds.join(", "));
    }

    sort_newest_first(&mut all_articles);
    Ok(all_articles)
}

/// Remove articles whose feed name is listed; returns the kept articles and the removed count.
pub fn exclude_feeds(articles: Vec<Article>, exclude: &[String]) -> (Vec<Article>, usize) {
    if exclude.is_empty() {
        return (articles, 0);
    }
    let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let before = articles.len();
    let kept: Vec<Article> = articles
        .into_iter()
        .filter(|a| !exclude.contains(a.feed_name.as_str()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Stable: equal timestamps keep category/page order.
pub fn sort_newest_first(articles: &mut [Article]) {
    articles.sort_by(|a, b| b.published.cmp(&a.published));
}

#[derive(Debug, Deserialize)]
struct StreamPage {
    #[serde(default)]
    items: Option<Vec<StreamItem>>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamItem {
    // any of these may come back as an explicit null
    #[serde(default)]
    published: Option<i64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    canonical: Option<Vec<Link>>,
    #[serde(default)]
    alternate: Option<Vec<Link>>,
    #[serde(default)]
    summary: Option<ItemSummary>,
    #[serde(default)]
    origin: Option<Origin>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemSummary {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Origin {
    #[serde(default)]
    title: Option<String>,
}

impl StreamItem {
    fn into_article(self) -> Article {
        // canonical wins whenever present, even with an empty href
        let link = self
            .canonical
            .unwrap_or_default()
            .into_iter()
            .next()
            .or_else(|| self.alternate.unwrap_or_default().into_iter().next())
            .and_then(|l| l.href)
            .unwrap_or_default();

        Article {
            link,
            title: self.title.unwrap_or_default(),
            content: self.summary.and_then(|s| s.content).unwrap_or_default(),
            published: self.published.unwrap_or_default(),
            feed_name: self
                .origin
                .and_then(|o| o.title)
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}
