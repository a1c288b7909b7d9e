//! Pipeline settings.
//!
//! Stored as an optional JSON file; every field has a default so an empty
//! object (or no file at all) gives the reference deployment:
//! ```json
//! {
//!   "data_dir": "data",
//!   "timezone": "Europe/Stockholm",
//!   "lines": ["green", "red", "blue"],
//!   "stopped_speed_threshold": 0.5,
//!   "lag_offsets_minutes": [15, 30, 45, 60],
//!   "fetch": { "max_attempts": 5, "wait_seconds": 5, "timeout_seconds": 30 }
//! }
//! ```
//! API keys are never stored here; they come from the environment.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extract::STOPPED_SPEED_THRESHOLD;
use crate::fetch::RetryPolicy;
use crate::lag::DEFAULT_LAG_OFFSETS;
use crate::layout::DataLayout;
use crate::model::{FeedKind, LineName};

pub const STATIC_API_KEY: &str = "STATIC_API_KEY";
pub const REALTIME_API_KEY: &str = "REALTIME_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub wait_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait_seconds: 5,
            timeout_seconds: 30,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.wait_seconds))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub lines: BTreeSet<LineName>,
    pub stopped_speed_threshold: f32,
    pub lag_offsets_minutes: Vec<u32>,
    /// `{feed}` is replaced by the feed name.
    pub realtime_url: String,
    pub static_url: String,
    pub fetch: FetchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            timezone: chrono_tz::Europe::Stockholm,
            lines: LineName::ALL.into_iter().collect(),
            stopped_speed_threshold: STOPPED_SPEED_THRESHOLD,
            lag_offsets_minutes: DEFAULT_LAG_OFFSETS.to_vec(),
            realtime_url: "https://opendata.samtrafiken.se/gtfs-rt/sl/{feed}.pb".to_string(),
            static_url: "https://opendata.samtrafiken.se/gtfs/sl/sl.zip".to_string(),
            fetch: FetchConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// `load` when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.lines.is_empty(), "config lists no lines");
        anyhow::ensure!(self.fetch.max_attempts > 0, "fetch.max_attempts must be positive");
        Ok(())
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn lines_vec(&self) -> Vec<LineName> {
        self.lines.iter().copied().collect()
    }

    pub fn feed_url(&self, feed: FeedKind) -> String {
        self.realtime_url.replace("{feed}", feed.as_str())
    }
}

/// Reads an API key from the environment (after `.env` has been loaded).
pub fn api_key(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("{var} must be set"))
}
