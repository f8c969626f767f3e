use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use costar_core::config_file::{self, default_cache_path};
use costar_core::{Config, ResponseCache, SearchOutcome, SearchSession, SeasonOrder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod output;

use output::ColorMode;

/// Find where and when two people worked together
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for collaborations between two people
    Search {
        /// First person's name
        name1: String,

        /// Second person's name
        name2: String,

        #[command(flatten)]
        opts: SearchOpts,
    },

    /// Interactive mode: each "Name A | Name B" line starts a new search,
    /// cancelling any search still running
    Repl {
        #[command(flatten)]
        opts: SearchOpts,
    },

    /// Inspect or clear the persistent response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Path to the cache database
        #[arg(long)]
        cache_path: Option<PathBuf>,
    },

    /// Create or locate the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the resolved settings to the platform config file
    Init {
        /// Replace an existing config file
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        opts: SearchOpts,
    },
    /// Print the platform config file location
    Path,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show cache location and size
    Stats,
    /// Delete every cached response
    Clear,
}

#[derive(Args, Debug)]
struct SearchOpts {
    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Bearer token for the API
    #[arg(long)]
    api_token: Option<String>,

    /// Count crew credits, not only cast
    #[arg(long)]
    include_crew: bool,

    /// Include adult results in person search
    #[arg(long)]
    include_adult: bool,

    /// Also scan season 0 ("Specials")
    #[arg(long)]
    include_specials: bool,

    /// Maximum seasons scanned per series
    #[arg(long)]
    max_seasons: Option<usize>,

    /// Season scan order: desc (most recent first) or asc
    #[arg(long)]
    season_order: Option<SeasonOrder>,

    /// Seasons scanned at a time
    #[arg(long)]
    season_concurrency: Option<usize>,

    /// Episodes scanned at a time, per season
    #[arg(long)]
    episode_concurrency: Option<usize>,

    /// Requests per second (0 disables pacing)
    #[arg(long)]
    rps: Option<u32>,

    /// Path to the persistent cache database
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Keep responses in memory only
    #[arg(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Command::Search { name1, name2, opts } => search(&name1, &name2, &opts).await,
        Command::Repl { opts } => repl(&opts).await,
        Command::Cache { action, cache_path } => cache_command(action, cache_path),
        Command::Config { action } => config_command(action),
    }
}

/// Logs go to stderr (or `--log-file`), filtered by `RUST_LOG`, default `warn`.
fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

/// Resolve configuration: CLI flags > env vars > config file > defaults
fn resolve_config(opts: &SearchOpts) -> Config {
    let mut config = Config::default();
    config_file::load_config().apply(&mut config);

    if let Ok(base) = std::env::var("COSTAR_API_BASE") {
        config.api_base_url = base;
    }
    if let Ok(token) = std::env::var("TMDB_API_TOKEN")
        && !token.is_empty()
    {
        config.api_token = Some(token);
    }

    if let Some(ref base) = opts.api_base {
        config.api_base_url = base.clone();
    }
    if let Some(ref token) = opts.api_token {
        config.api_token = Some(token.clone());
    }
    config.include_crew |= opts.include_crew;
    config.include_adult |= opts.include_adult;
    config.tv_check.include_specials |= opts.include_specials;
    if let Some(n) = opts.max_seasons {
        config.tv_check.max_seasons = n;
    }
    if let Some(order) = opts.season_order {
        config.tv_check.season_order = order;
    }
    if let Some(n) = opts.season_concurrency {
        config.tv_check.season_concurrency = n.max(1);
    }
    if let Some(n) = opts.episode_concurrency {
        config.tv_check.episode_concurrency = n.max(1);
    }
    if let Some(rps) = opts.rps {
        config.requests_per_second = (rps > 0).then_some(rps);
    }

    if opts.no_cache {
        config.cache_path = None;
    } else if let Some(ref path) = opts.cache_path {
        config.cache_path = Some(path.clone());
    } else if config.cache_path.is_none() {
        config.cache_path = default_cache_path();
    }

    tracing::debug!(?config, "resolved configuration");
    config
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn build_session(opts: &SearchOpts) -> Arc<SearchSession> {
    let config = resolve_config(opts);
    let session = Arc::new(SearchSession::new(costar_core::build_tmdb(&config)));

    // Ctrl+C cancels the running search; the outcome reports it as
    // superseded. With nothing running it exits.
    let cancel_target = Arc::clone(&session);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !cancel_target.is_running() {
                std::process::exit(130);
            }
            cancel_target.cancel_current();
            eprintln!("Cancelled. Ctrl+C again to quit.");
        }
    });

    session
}

async fn search(name1: &str, name2: &str, opts: &SearchOpts) -> anyhow::Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    let color = ColorMode(!opts.no_color && std::io::stdout().is_terminal());
    let session = build_session(opts);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(120));

    let progress = {
        let spinner = spinner.clone();
        move |event| spinner.set_message(output::progress_message(&event))
    };
    let outcome = session.search(name1, name2, today(), progress).await;
    spinner.finish_and_clear();

    let mut stdout = std::io::stdout().lock();
    match outcome {
        SearchOutcome::Completed(report) => {
            output::print_report(&mut stdout, &report, color)?;
            Ok(())
        }
        SearchOutcome::NotFound { name } => {
            output::print_not_found(&mut stdout, &name, color)?;
            std::process::exit(1);
        }
        SearchOutcome::Failed(e) => {
            output::print_failure(&mut stdout, color)?;
            Err(anyhow::Error::new(e).context("search failed"))
        }
        SearchOutcome::Superseded => {
            writeln!(stdout, "Search cancelled.")?;
            Ok(())
        }
    }
}

/// Split a `Name A | Name B` line.
fn parse_pair(line: &str) -> Option<(String, String)> {
    let (a, b) = line.split_once('|')?;
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

async fn repl(opts: &SearchOpts) -> anyhow::Result<()> {
    let color = ColorMode(!opts.no_color && std::io::stdout().is_terminal());
    let session = build_session(opts);

    println!(
        "Enter two names separated by '|' (e.g. Tom Hanks | Meg Ryan). \
         Ctrl+D, \"quit\" or Ctrl+C while idle to exit."
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        let Some((name1, name2)) = parse_pair(line) else {
            println!("Please enter both names, separated by '|'.");
            continue;
        };

        // The new search supersedes the old one inside `search`; the old
        // task then finishes quietly on its own.
        let session = Arc::clone(&session);
        running = Some(tokio::spawn(async move {
            let progress = move |event| {
                let mut err = std::io::stderr().lock();
                let _ = output::print_progress(&mut err, &event, color);
            };
            let outcome = session.search(&name1, &name2, today(), progress).await;

            let mut out = std::io::stdout().lock();
            let printed = match outcome {
                SearchOutcome::Completed(report) => output::print_report(&mut out, &report, color),
                SearchOutcome::NotFound { name } => output::print_not_found(&mut out, &name, color),
                SearchOutcome::Failed(e) => {
                    tracing::error!(error = %e, "search failed");
                    output::print_failure(&mut out, color)
                }
                SearchOutcome::Superseded => Ok(()),
            };
            let _ = printed.and_then(|_| out.flush());
        }));
    }

    if let Some(handle) = running {
        let _ = handle.await;
    }
    Ok(())
}

fn cache_command(action: CacheAction, cache_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = Config::default();
    config_file::load_config().apply(&mut config);
    let path = cache_path
        .or(config.cache_path)
        .or_else(default_cache_path)
        .ok_or_else(|| anyhow::anyhow!("could not determine a cache location; pass --cache-path"))?;

    if !path.exists() {
        println!("No cache at {}", path.display());
        return Ok(());
    }

    let cache = ResponseCache::open(&path, Duration::from_secs(config.cache_ttl_secs))?;
    match action {
        CacheAction::Stats => {
            println!("Cache:   {}", path.display());
            println!("Entries: {}", cache.disk_len());
            println!("TTL:     {}h", cache.ttl().as_secs() / 3600);
        }
        CacheAction::Clear => {
            let removed = cache.disk_len();
            cache.clear();
            println!("Removed {} cached responses from {}", removed, path.display());
        }
    }
    Ok(())
}

/// Settings written by `config init`. The token is kept only when given
/// on the command line, never copied in from the environment.
fn starter_config(opts: &SearchOpts) -> config_file::ConfigFile {
    let mut config = resolve_config(opts);
    config.api_token = opts.api_token.clone();
    if opts.cache_path.is_none() && config.cache_path == default_cache_path() {
        config.cache_path = None;
    }
    config_file::ConfigFile::from(&config)
}

fn config_command(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => match config_file::config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("could not determine the config directory"),
        },
        ConfigAction::Init { force, opts } => {
            if let Some(existing) = config_file::config_path().filter(|p| p.exists())
                && !force
            {
                anyhow::bail!(
                    "{} already exists; pass --force to replace it",
                    existing.display()
                );
            }
            let path =
                config_file::save_config(&starter_config(&opts)).map_err(anyhow::Error::msg)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
