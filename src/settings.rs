use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

pub const DEFAULT_FEED_URL: &str = "https://api.github.com/events";
/// Upstream refuses `per_page` above this.
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub feed_url: String,
    pub per_page: u32,
    pub max_pages: usize,
    pub interval_secs: u64,
    pub page_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub kinds: Vec<String>,
    pub data_dir: PathBuf,
    pub db_file: String,
    pub busy_timeout_ms: u64,
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub token: Option<String>,
}

impl Settings {
    /// Defaults, then `harvester.toml` if present, then `HARVESTER_*` env vars.
    pub fn load() -> Result<Self> {
        let mut settings: Settings = Config::builder()
            .set_default("feed_url", DEFAULT_FEED_URL)?
            .set_default("per_page", MAX_PER_PAGE)?
            .set_default("max_pages", 3)?
            .set_default("interval_secs", 15)?
            .set_default("page_delay_ms", 1000)?
            .set_default("request_timeout_secs", 10)?
            .set_default("kinds", vec!["WatchEvent", "PullRequestEvent", "IssuesEvent"])?
            .set_default("data_dir", "data")?
            .set_default("db_file", "events.sqlite")?
            .set_default("busy_timeout_ms", 5000)?
            .set_default("max_payload_bytes", 256 * 1024)?
            .add_source(File::with_name("harvester").required(false))
            .add_source(
                Environment::with_prefix("HARVESTER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kinds"),
            )
            .build()?
            .try_deserialize()
            .context("Invalid harvester settings")?;

        if settings.token.as_deref().map_or(true, str::is_empty) {
            settings.token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        }
        Ok(settings)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }

    pub fn allowed_kinds(&self) -> HashSet<String> {
        self.kinds.iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect()
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
