//! Configuration for newsfan.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (NEWSFAN_HOME, NEWSFAN_CONFIG)
//! 2. Config file (.newsfan/config.yaml)
//! 3. Defaults (~/.newsfan, built-in limits and timeouts)
//!
//! Config file discovery:
//! - NEWSFAN_CONFIG names the file explicitly (worker processes get it this way)
//! - Otherwise searches current directory and parents for .newsfan/config.yaml
//! - Paths in the config file are relative to the .newsfan/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::ProviderSettings;
use crate::core::cache::CacheSettings;
use crate::core::rate_limiter::LimitSettings;
use crate::core::retry::RetryPolicy;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "NEWSFAN_CONFIG";

/// Environment variable overriding the engine state directory
pub const HOME_ENV: &str = "NEWSFAN_HOME";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Config file schema; every section is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub isolation: Isolation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .newsfan/)
    pub home: Option<String>,
}

/// Batch deadlines; `None` waits for every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default)]
    pub web_search_seconds: Option<u64>,

    #[serde(default = "default_crawl_seconds")]
    pub crawl_seconds: Option<u64>,

    #[serde(default)]
    pub relevance_seconds: Option<u64>,

    /// Per-request HTTP timeout for page fetches
    #[serde(default = "default_fetch_seconds")]
    pub fetch_seconds: u64,
}

fn default_crawl_seconds() -> Option<u64> {
    Some(5)
}
fn default_fetch_seconds() -> u64 {
    5
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            web_search_seconds: None,
            crawl_seconds: default_crawl_seconds(),
            relevance_seconds: None,
            fetch_seconds: default_fetch_seconds(),
        }
    }
}

impl TimeoutSettings {
    pub fn web_search(&self) -> Option<Duration> {
        self.web_search_seconds.map(Duration::from_secs)
    }

    pub fn crawl(&self) -> Option<Duration> {
        self.crawl_seconds.map(Duration::from_secs)
    }

    pub fn relevance(&self) -> Option<Duration> {
        self.relevance_seconds.map(Duration::from_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_seconds)
    }
}

/// Stage tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Independent relevance completions per run
    #[serde(default = "default_completions")]
    pub completions: usize,

    /// Search terms requested per generation step
    #[serde(default = "default_search_terms_per_step")]
    pub search_terms_per_step: usize,

    /// Host glob patterns never crawled
    #[serde(default = "default_excluded_hosts")]
    pub excluded_hosts: Vec<String>,
}

fn default_completions() -> usize {
    3
}
fn default_search_terms_per_step() -> usize {
    5
}
fn default_excluded_hosts() -> Vec<String> {
    vec!["www.msn.com".to_string()]
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            completions: default_completions(),
            search_terms_per_step: default_search_terms_per_step(),
            excluded_hosts: default_excluded_hosts(),
        }
    }
}

/// Where calls execute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One worker process per call (hard-kill at the deadline)
    #[default]
    Process,
    /// Tasks in the current process
    InProcess,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to newsfan home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: Settings,
}

impl ResolvedConfig {
    /// Cache database path (`cache.path` or `$NEWSFAN_HOME/cache.db`)
    pub fn cache_path(&self) -> PathBuf {
        self.settings
            .cache
            .path
            .clone()
            .unwrap_or_else(|| self.home.join("cache.db"))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".newsfan").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve settings read from `config_file` (or defaults) against `home_override`
fn resolve(
    config_file: Option<PathBuf>,
    home_override: Option<PathBuf>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (mut settings, config_dir) = match &config_file {
        Some(path) => (
            load_config_file(path)?,
            path.parent().map(Path::to_path_buf),
        ),
        None => (Settings::default(), None),
    };

    let home = match (home_override, &settings.paths.home, &config_dir) {
        (Some(home), _, _) => home,
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    if let (Some(dir), Some(cache_path)) = (&config_dir, &settings.cache.path) {
        if cache_path.is_relative() {
            settings.cache.path = Some(resolve_path(dir, &cache_path.to_string_lossy()));
        }
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        settings,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".newsfan");
    let home_override = std::env::var(HOME_ENV).ok().map(PathBuf::from);

    resolve(find_config_file(), home_override, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
