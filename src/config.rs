use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host serving work item pages and the REST API
    pub host: String,
    pub timing: Timing,
    pub settings: Settings,
}

/// Delays used while waiting on pages and loads
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Wait after a navigation before reading the rendered title (ms)
    pub title_settle_ms: u64,
    /// Longest the auto-select waits for one dropdown load (ms)
    pub load_timeout_ms: u64,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// API request timeout in seconds
    pub api_timeout: u64,
    pub api_version: String,
    /// Cap on ids fetched per work item query
    pub max_work_items: usize,
    /// Where credentials and time entries live (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "dev.azure.com".to_string(),
            timing: Timing::default(),
            settings: Settings::default(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            title_settle_ms: 500,
            load_timeout_ms: 10_000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_timeout: 30,
            api_version: "7.0".to_string(),
            max_work_items: 50,
            data_dir: None,
        }
    }
}

impl Timing {
    pub fn title_settle(&self) -> Duration {
        Duration::from_millis(self.title_settle_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Config {
    pub fn load() -> Self {
        let mut candidates = Vec::new();
        // 1. XDG path (~/.config/adotrack/config.toml), common on macOS too
        if let Some(home_dir) = dirs::home_dir() {
            candidates.push(home_dir.join(".config").join("adotrack").join("config.toml"));
        }
        // 2. Platform config dir (~/Library/Application Support/ on macOS)
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("adotrack").join("config.toml"));
        }
        // 3. ~/.adotrack.toml
        if let Some(home_dir) = dirs::home_dir() {
            candidates.push(home_dir.join(".adotrack.toml"));
        }

        for path in candidates {
            if let Some(config) = Self::load_from(&path) {
                return config;
            }
        }

        Config::default()
    }

    fn load_from(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable config: {e}");
                None
            }
        }
    }

    /// Directory holding the key-value store.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.settings
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("adotrack")))
    }
}
