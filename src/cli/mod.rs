//! Command-line interface for newsfan.
//!
//! Provides commands for running a news query, managing the call cache and
//! inspecting the resolved configuration. The hidden `worker` command is the
//! entry point of isolated worker processes.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::adapters::build_providers;
use crate::config::{self, Isolation, ResolvedConfig, Settings, CONFIG_ENV, HOME_ENV};
use crate::core::{
    progress, Cache, CallContext, CallRunner, InProcessRunner, Orchestrator, ProgressSink, RateLimiters,
};
use crate::stages::StageContext;
use crate::worker::{serve_call, ParentLink, ProcessRunner};

/// newsfan - Most impactful recent news for a query
#[derive(Parser, Debug)]
#[command(name = "newsfan")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the news pipeline for a query, streaming NDJSON progress to stdout
    Run {
        /// What to find news about (a ticker, company, topic)
        query: String,

        /// Execute calls as tasks in this process instead of worker processes
        #[arg(long)]
        in_process: bool,

        /// Override the search requests admitted per window
        #[arg(long, env = "NEWSFAN_SEARCH_RATE")]
        search_rate: Option<u32>,

        /// Override the language-model requests admitted per window
        #[arg(long, env = "NEWSFAN_LLM_RATE")]
        llm_rate: Option<u32>,
    },

    /// Execute one call received on stdin (used by worker processes)
    #[command(hide = true)]
    Worker,

    /// Manage the call cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Delete expired entries
    Purge {
        /// Delete every entry, live or not
        #[arg(long)]
        all: bool,
    },

    /// Show entry counts
    Stats,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                query,
                in_process,
                search_rate,
                llm_rate,
            } => run_query(&query, in_process, search_rate, llm_rate).await,
            Commands::Worker => run_worker().await,
            Commands::Cache { command } => match command {
                CacheCommands::Purge { all } => purge_cache(all),
                CacheCommands::Stats => show_cache_stats(),
            },
            Commands::Config => show_config(),
        }
    }
}

/// Reject queries too short to mean anything
fn validate_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.chars().count() <= 1 {
        anyhow::bail!("Query must be longer than one character");
    }
    Ok(query)
}

fn open_cache(cfg: &ResolvedConfig) -> Result<Cache> {
    Cache::from_settings(&cfg.settings.cache, &cfg.home)
        .with_context(|| format!("Failed to open cache: {}", cfg.cache_path().display()))
}

/// Build the runner selected by `isolation`
fn build_runner(
    cfg: &ResolvedConfig,
    settings: &Settings,
    isolation: Isolation,
    limiters: RateLimiters,
    cache: Cache,
    sink: ProgressSink,
) -> Result<Arc<dyn CallRunner>> {
    match isolation {
        Isolation::InProcess => {
            let providers = build_providers(&settings.providers, settings.timeouts.fetch())?;
            let context = CallContext::new(
                providers,
                cache,
                settings.retry.clone(),
                Arc::new(limiters),
                sink,
            );
            Ok(Arc::new(InProcessRunner::new(context)))
        }
        Isolation::Process => {
            let mut runner = ProcessRunner::current_exe(Arc::new(limiters), sink)?
                .env(HOME_ENV, cfg.home.to_string_lossy());
            if let Some(config_file) = &cfg.config_file {
                runner = runner.env(CONFIG_ENV, config_file.to_string_lossy());
            }
            Ok(Arc::new(runner))
        }
    }
}

/// Run the pipeline for one query
async fn run_query(
    query: &str,
    in_process: bool,
    search_rate: Option<u32>,
    llm_rate: Option<u32>,
) -> Result<()> {
    let query = validate_query(query)?;
    let cfg = config::config()?;

    let mut settings = cfg.settings.clone();
    if let Some(rate) = search_rate {
        settings.limits.search_per_sec = rate;
    }
    if let Some(rate) = llm_rate {
        settings.limits.llm_per_sec = rate;
    }
    let isolation = if in_process {
        Isolation::InProcess
    } else {
        settings.isolation
    };

    let limiters = RateLimiters::from_settings(&settings.limits).context("Invalid rate limits")?;
    limiters.start_resets();
    let cache = open_cache(cfg)?;
    let (sink, stream) = progress::channel();

    let runner = build_runner(cfg, &settings, isolation, limiters, cache.clone(), sink.clone())?;
    info!(query, runner = runner.name(), "Running news pipeline");

    let orchestrator = Orchestrator::new(StageContext::new(runner, cache, Arc::new(settings), sink));
    let mut stdout = tokio::io::stdout();
    let (result, written) = tokio::join!(
        orchestrator.run_to_sink(query),
        stream.write_ndjson(&mut stdout)
    );

    let written = written.context("Failed to write progress to stdout")?;
    debug!(events = written, "Progress stream closed");
    result.with_context(|| format!("News run for '{}' failed", query))?;
    Ok(())
}

/// Serve exactly one call for a parent process over stdin/stdout
async fn run_worker() -> Result<()> {
    let cfg = config::config()?;
    let link = Arc::new(ParentLink::new(tokio::io::stdin(), tokio::io::stdout()));

    serve_call(link, |admission, sink| {
        let settings = &cfg.settings;
        let providers = build_providers(&settings.providers, settings.timeouts.fetch())?;
        let cache = open_cache(cfg)?;
        Ok(CallContext::new(
            providers,
            cache,
            settings.retry.clone(),
            admission,
            sink,
        ))
    })
    .await
    .context("Worker protocol failure")
}

fn purge_cache(all: bool) -> Result<()> {
    let cfg = config::config()?;
    let cache = open_cache(cfg)?;

    let removed = if all {
        cache.clear()
    } else {
        cache.purge_expired()
    }
    .context("Failed to purge cache")?;

    println!(
        "Removed {} {} from {}",
        removed,
        if all { "entries" } else { "expired entries" },
        cache.path().display()
    );
    Ok(())
}

fn show_cache_stats() -> Result<()> {
    let cfg = config::config()?;
    let cache = open_cache(cfg)?;
    let stats = cache.stats().context("Failed to read cache stats")?;

    println!("Cache: {}", cache.path().display());
    println!("  Entries:   {}", stats.entries);
    println!("  Live:      {}", stats.live);
    println!("  No result: {}", stats.no_result);
    println!("  Expired:   {}", stats.expired);
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("newsfan configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home (engine state): {}", cfg.home.display());
    println!("Cache database:      {}", cfg.cache_path().display());
    println!();
    print!(
        "{}",
        serde_yaml::to_string(&cfg.settings).context("Failed to render settings")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_query() {
        assert_eq!(validate_query("  SPY ").unwrap(), "SPY");
        assert!(validate_query("a").is_err());
        assert!(validate_query(" ").is_err());
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "newsfan",
            "run",
            "US stocks",
            "--in-process",
            "--llm-rate",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                query,
                in_process,
                llm_rate,
                ..
            } => {
                assert_eq!(query, "US stocks");
                assert!(in_process);
                assert_eq!(llm_rate, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_cache_purge() {
        let cli = Cli::try_parse_from(["newsfan", "cache", "purge", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Purge { all: true }
            }
        ));
    }
}
