/*!
common/src/lib.rs

Shared configuration and DB helper functions for newsdigest.

This file provides:
- `Settings`, the flat key/value configuration surface (TOML defaults, `.env`, process env)
- Typed, validated per-stage configuration (see `config`)
- A helper to open the aggregator's SQLite database read-only
*/

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

pub mod config;

pub use config::{
    AbstractorConfig, DatabaseSourceConfig, DropboxConfig, ExtractorConfig, LlmConfig, LlmStage,
    PublishTarget, ReaderApiConfig, SourceConfig, SourceOverrides, SummarizerConfig,
    SyncToolConfig,
};

/// Flat key/value settings. Keys use the environment variable names
/// (e.g. `LLM_API_KEY`); values are stored as strings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Build settings from explicit pairs. Used by tests and embedders that do not
    /// want to touch the process environment.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut settings = Self::default();
        settings.overlay(pairs);
        settings
    }

    /// Load settings with an optional default file and an optional override file.
    ///
    /// Precedence, lowest first: default TOML, override TOML, `.env`, process environment.
    /// `.env` never replaces variables already present in the process.
    pub async fn load(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .with_context(|| format!("Failed to parse default configuration: {}", path.display()))?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .with_context(|| format!("Failed to parse override configuration: {}", path.display()))?;
                merge_toml(&mut config_value, val);
            }
        }

        match dotenv::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env file"),
            Err(e) => debug!("no .env file loaded: {}", e),
        }

        let mut settings = Self::from_toml(&config_value);
        settings.overlay(std::env::vars());
        Ok(settings)
    }

    /// Top-level scalar values of a TOML document become settings; tables and arrays are ignored.
    pub fn from_toml(value: &toml::Value) -> Self {
        let mut settings = Self::default();
        if let toml::Value::Table(table) = value {
            for (key, val) in table {
                let text = match val {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    toml::Value::Datetime(d) => d.to_string(),
                    toml::Value::Array(_) | toml::Value::Table(_) => continue,
                };
                settings.values.insert(key.clone(), text);
            }
        }
        settings
    }

    /// Insert every pair, replacing existing keys.
    pub fn overlay<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in pairs {
            self.values.insert(k.into(), v.into());
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Trimmed value for `key`. Empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .with_context(|| format!("Missing required setting {}", key))
    }

    /// First key in `keys` that has a value.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Comma-separated list; entries are trimmed and empty entries dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse `key`, falling back to `default` when unset or invalid.
    pub fn parse_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, value = raw, "invalid setting ({}), using default", e);
                    default
                }
            },
        }
    }

    /// Boolean switch: `1`, `true`, `yes` and `on` (any case) are true.
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }

    /// Names from `keys` that have no value, in the given order.
    pub fn missing<'a>(&self, keys: &[&'a str]) -> Vec<&'a str> {
        keys.iter().copied().filter(|k| self.get(k).is_none()).collect()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Open the aggregator's SQLite database read-only.
///
/// The aggregator owns the file; this system never writes to it, so a missing
/// file is reported instead of being created.
pub async fn open_read_only_pool(path: &Path) -> Result<SqlitePool> {
    if tokio::fs::metadata(path).await.is_err() {
        anyhow::bail!("database file '{}' not found", path.display());
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open sqlite database at path: {}", path.display()))?;

    Ok(pool)
}
