use anyhow::{Context, Result};
use common::DatabaseSourceConfig;
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{Article, TimeWindow};

/// Read the window from a FreshRSS SQLite file.
pub async fn fetch_articles(cfg: &DatabaseSourceConfig, window: &TimeWindow) -> Result<Vec<Article>> {
    let pool = common::open_read_only_pool(&cfg.path).await?;
    let result = query_articles(&pool, cfg, window).await;
    pool.close().await;
    result
}

/// Entries from allowed feeds (by name, or by category + URL substring), newest first.
pub async fn query_articles(
    pool: &SqlitePool,
    cfg: &DatabaseSourceConfig,
    window: &TimeWindow,
) -> Result<Vec<Article>> {
    let feed_name_conditions = vec!["f.name = ?"; cfg.allowed_feed_names.len()].join(" OR ");
    let sql = format!(
        r#"
        SELECT e.link, e.title, e.content, e.date, f.name
        FROM entry e
        JOIN feed f ON e.id_feed = f.id
        WHERE e.date BETWEEN ? AND ?
          AND (
            {}
            OR (f.category = ? AND f.url LIKE ?)
          )
        ORDER BY e.date DESC
        "#,
        feed_name_conditions
    );

    let mut query = sqlx::query(&sql).bind(window.start_ts).bind(window.end_ts);
    for name in &cfg.allowed_feed_names {
        query = query.bind(name.as_str());
    }
    let url_pattern = format!("%{}%", cfg.extra_url_contains);
    query = query.bind(cfg.extra_category_id).bind(url_pattern.as_str());

    let rows = query
        .fetch_all(pool)
        .await
        .context("Failed to query entries from the aggregator database")?;

    let articles = rows
        .iter()
        .map(|row| -> Result<Article, sqlx::Error> {
            Ok(Article {
                link: row.try_get::<Option<String>, _>("link")?.unwrap_or_default(),
                title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
                content: row.try_get::<Option<String>, _>("content")?.unwrap_or_default(),
                published: row.try_get::<Option<i64>, _>("date")?.unwrap_or(0),
                feed_name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode entry row")?;

    info!("Fetched {} entries from database", articles.len());
    Ok(articles)
}
