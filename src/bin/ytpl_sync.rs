#![forbid(unsafe_code)]

//! Syncs every configured playlist once and exits, the way a cron job wants
//! it. `--watch` keeps repeating the cycle on the configured interval.
//!
//! stdout carries one absolute directory path per completed item and nothing
//! else; logs and the run summary go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};
use ytpl_sync::{
    config::{Config, ConfigOverrides, load_config},
    engine::{Engine, RunStats},
    fetcher::YtDlpFetcher,
    logging::init_logging,
    remote::{TokenProvider, YouTubeClient},
    security::ensure_not_root,
};

const EXIT_DEGRADED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "ytpl_sync")]
#[command(about = "Download new playlist entries and prune them from the playlist")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `ytpl_sync=trace` (RUST_LOG still wins)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Keep running, syncing every `check_interval_seconds`
    #[arg(long)]
    watch: bool,
}

/// Errors that stop the process before any playlist work.
enum Fatal {
    Config(anyhow::Error),
    Auth(anyhow::Error),
}

impl Fatal {
    fn report(&self) -> ExitCode {
        match self {
            Fatal::Config(err) => {
                error!("configuration error: {err:#}");
                eprintln!("configuration error: {err:#}");
                ExitCode::from(EXIT_CONFIG)
            }
            Fatal::Auth(err) => {
                error!("authentication error: {err:#}");
                eprintln!("authentication error: {err:#}");
                ExitCode::from(EXIT_AUTH)
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = ensure_not_root("ytpl_sync") {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let config = match load_config(ConfigOverrides {
        config_path: cli.config.clone(),
        ..ConfigOverrides::default()
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    let _log_guard = init_logging(&level, config.general.log_file.as_deref());

    match run(&cli, &config) {
        Ok(stats) if stats.is_degraded() => ExitCode::from(EXIT_DEGRADED),
        Ok(_) => ExitCode::SUCCESS,
        Err(fatal) => fatal.report(),
    }
}

fn run(cli: &Cli, config: &Config) -> Result<RunStats, Fatal> {
    info!(config = %config.path.display(), playlists = config.targets.len(), "starting");
    if config.targets.is_empty() {
        warn!("no playlists configured, nothing to do");
    }

    let fetcher = YtDlpFetcher::new(config.fetcher.options());
    let version = fetcher
        .ensure_available()
        .with_context(|| format!("{} is required", config.fetcher.program.display()))
        .map_err(Fatal::Config)?;
    info!(%version, "media fetcher available");

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(HTTP_CONNECT_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("ytpl-sync/", env!("CARGO_PKG_VERSION")))
        .build();
    let tokens = TokenProvider::load(
        &config.general.token_storage_file,
        &config.general.client_secrets_file,
        agent.clone(),
    )
    .map_err(|err| Fatal::Auth(anyhow!(err)))?;
    tokens
        .authenticate()
        .map_err(|err| Fatal::Auth(anyhow!(err)))?;
    let client = YouTubeClient::new(agent, tokens);

    loop {
        let stats = sync_once(&client, &fetcher, config);
        write_summary(&mut io::stderr().lock(), &stats);
        if !cli.watch {
            return Ok(stats);
        }
        info!(
            seconds = config.general.check_interval_seconds,
            "waiting for the next check"
        );
        thread::sleep(config.check_interval());
    }
}

fn sync_once(client: &YouTubeClient, fetcher: &YtDlpFetcher, config: &Config) -> RunStats {
    let engine = Engine::new(client, client, fetcher, Local::now().date_naive())
        .with_retry(config.retry.policy())
        .with_fetch_retry(config.fetcher.fetch_policy())
        .with_stale_removals(config.general.retry_stale_removals);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let stats = engine.run(&config.targets, &mut out);
    if let Err(err) = out.flush() {
        warn!("could not flush stdout: {err}");
    }
    stats
}

/// The one place the run summary is reported.
fn write_summary(err: &mut dyn Write, stats: &RunStats) {
    // Nothing sensible is left to do when stderr is gone.
    let _ = writeln!(err, "Summary: {stats}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "ytpl_sync",
            "--config",
            "/etc/ytpl.toml",
            "--log-level",
            "debug",
            "--watch",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/ytpl.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.watch);

        let defaults = Cli::parse_from(["ytpl_sync"]);
        assert!(defaults.config.is_none());
        assert!(!defaults.watch);
    }

    #[test]
    fn summary_is_a_single_line() {
        let mut stats = RunStats::new();
        stats.new_downloaded = 2;
        let mut err = Vec::new();
        write_summary(&mut err, &stats);
        let text = String::from_utf8_lossy(&err);
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("Summary: playlists processed: 0"));
        assert!(text.contains("new downloads: 2"));
    }
}
