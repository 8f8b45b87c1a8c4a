use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - Which sources run, in which order
// - Where each source lives (endpoints)
// - Scheduling budgets (timeouts, cool-down)
// - HTTP / rendering session settings
// - History file location and retention
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Sources in configured order
    pub sources: Vec<SourceConfig>,

    /// Source id -> endpoint URL
    #[serde(default)]
    pub endpoints: HashMap<String, String>,

    /// Optional JSON file with more endpoints (`{"kotak": "https://..."}`).
    /// Inline `endpoints` win on conflicts.
    #[serde(default)]
    pub endpoints_file: Option<PathBuf>,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub webdriver: WebDriverConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ------------------------------------------------------------
// Source entry
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Stable short code (e.g. "kotak", "sbi")
    pub id: String,

    /// Enables or disables this source at runtime
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ------------------------------------------------------------
// Scheduling budgets
// ------------------------------------------------------------
//
// - stateful_timeout: session startup + page render, per source
// - stateless_timeout: per stateless source
// - stateless_phase_timeout: bounds the whole concurrent phase
// - cooldown: pause between two stateful sources
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub stateful_timeout_secs: u64,
    pub stateless_timeout_secs: u64,
    pub stateless_phase_timeout_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            stateful_timeout_secs: 90,
            stateless_timeout_secs: 20,
            stateless_phase_timeout_secs: 30,
            cooldown_secs: 10,
        }
    }
}

// ------------------------------------------------------------
// HTTP client settings (stateless collectors)
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 30,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// ------------------------------------------------------------
// Rendering session (WebDriver) settings
// ------------------------------------------------------------
//
// NOTES:
// - `url` points at a running WebDriver server (chromedriver).
// - When `command` is set, a driver process is spawned for
//   every session on `url`'s port and killed on release.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebDriverConfig {
    pub url: String,
    pub command: Option<String>,
    pub startup_timeout_secs: u64,
    pub page_load_timeout_secs: u64,
    pub element_wait_secs: u64,
    pub args: Vec<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            command: None,
            startup_timeout_secs: 15,
            page_load_timeout_secs: 90,
            element_wait_secs: 15,
            args: vec![
                "--headless=new".to_string(),
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--window-size=1920,1080".to_string(),
                format!("user-agent={DEFAULT_USER_AGENT}"),
            ],
        }
    }
}

// ------------------------------------------------------------
// History file settings
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: PathBuf,
    pub retention_days: usize,
    pub lock_timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("all_banks_data.json"),
            retention_days: crate::history::DEFAULT_RETENTION_DAYS,
            lock_timeout_secs: 10,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Reads and validates the configuration.
    ///
    /// Relative `endpoints_file` paths are resolved against the
    /// directory of the config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if let Some(file) = cfg.endpoints_file.clone() {
            let file = match path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file,
            };
            let extra = load_endpoints(&file)?;
            for (id, url) in extra {
                cfg.endpoints.entry(id).or_insert(url);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.schedule;
        if s.stateful_timeout_secs == 0
            || s.stateless_timeout_secs == 0
            || s.stateless_phase_timeout_secs == 0
        {
            bail!("schedule timeouts must be greater than zero");
        }
        if self.history.retention_days == 0 {
            bail!("history.retention_days must be greater than zero");
        }

        let mut seen = HashSet::new();
        for src in &self.sources {
            if !seen.insert(src.id.as_str()) {
                bail!("source '{}' is configured more than once", src.id);
            }
        }
        Ok(())
    }

    /// Enabled source ids in configured order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter(|s| s.enabled).map(|s| s.id.as_str())
    }
}

impl ScheduleConfig {
    pub fn stateful_timeout(&self) -> Duration {
        Duration::from_secs(self.stateful_timeout_secs)
    }

    pub fn stateless_timeout(&self) -> Duration {
        Duration::from_secs(self.stateless_timeout_secs)
    }

    pub fn stateless_phase_timeout(&self) -> Duration {
        Duration::from_secs(self.stateless_phase_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Loads a flat `{ "id": "url" }` endpoint map.
pub fn load_endpoints(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading endpoints {}", path.display()))?;
    let map = serde_json::from_str(&data)
        .with_context(|| format!("parsing endpoints {}", path.display()))?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{ "sources": [ { "id": "kotak" } ] }"#).unwrap();
        assert!(cfg.sources[0].enabled);
        assert_eq!(cfg.schedule.cooldown_secs, 10);
        assert_eq!(cfg.history.retention_days, 15);
        assert_eq!(cfg.webdriver.url, "http://localhost:9515");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let cfg: Config =
            serde_json::from_str(r#"{ "sources": [ { "id": "hsbc" }, { "id": "hsbc" } ] }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let cfg: Config = serde_json::from_str(
            r#"{ "sources": [], "schedule": { "stateless_timeout_secs": 0 } }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn endpoints_file_is_merged_under_inline_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bank_urls.json"),
            r#"{ "hsbc": "https://file.example/hsbc", "canara": "https://file.example/canara" }"#,
        )
        .unwrap();
        let cfg_path = dir.path().join("config.json");
        fs::write(
            &cfg_path,
            r#"{
                "sources": [ { "id": "hsbc" }, { "id": "canara", "enabled": false } ],
                "endpoints": { "hsbc": "https://inline.example/hsbc" },
                "endpoints_file": "bank_urls.json"
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.endpoints["hsbc"], "https://inline.example/hsbc");
        assert_eq!(cfg.endpoints["canara"], "https://file.example/canara");
        assert_eq!(cfg.enabled_sources().collect::<Vec<_>>(), vec!["hsbc"]);
    }
}
