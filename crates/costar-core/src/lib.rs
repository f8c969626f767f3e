use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod collab;
pub mod config_file;
pub mod fetcher;
pub mod mock;
pub mod overlap;
pub mod rate_limit;
pub mod scheduler;
pub mod session;
pub mod tmdb;

// Re-export for convenience
pub use cache::{DEFAULT_TTL, ResponseCache};
pub use collab::{find_collaborations, format_since};
pub use fetcher::{FetchOptions, Fetcher, ReqwestTransport, Transport};
pub use scheduler::map_limit;
pub use session::{SearchOutcome, SearchSession};
pub use tmdb::Tmdb;

/// Default upstream: a TMDb proxy that needs no API key.
pub const DEFAULT_API_BASE_URL: &str = "https://themoviedb-proxy.netlify.app/api";

/// Whether a credit belongs to the movie or the TV namespace.
///
/// Credit ids are only unique within one namespace, so every identity
/// comparison uses `(id, media_type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

/// A single appearance of a person in a movie or TV series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    /// Character name for cast credits, job for crew credits.
    pub role: Option<String>,
    pub poster_ref: Option<String>,
}

impl Credit {
    pub fn key(&self) -> CreditKey {
        CreditKey {
            id: self.id,
            media_type: self.media_type,
        }
    }
}

/// Identity of a credit across both namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreditKey {
    pub id: u64,
    pub media_type: MediaType,
}

/// The subset of a person's details the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersonProfile {
    pub id: u64,
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

/// The episode both people appear in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMatch {
    pub season_number: u32,
    pub episode_number: u32,
    pub air_date: Option<NaiveDate>,
    pub episode_name: Option<String>,
}

/// A title both people are credited in.
///
/// Before TV confirmation this is a candidate; after the merge it is a
/// confirmed collaboration. `episode` is only ever set for TV entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub person1_role: Option<String>,
    pub person2_role: Option<String>,
    pub person1_age: Option<i32>,
    pub person2_age: Option<i32>,
    pub poster_ref: Option<String>,
    pub episode: Option<EpisodeMatch>,
}

impl CandidatePair {
    pub fn key(&self) -> CreditKey {
        CreditKey {
            id: self.id,
            media_type: self.media_type,
        }
    }
}

/// One of the two people being compared, as echoed back in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: u64,
    /// The name as the caller typed it.
    pub name: String,
    pub birth_date: Option<NaiveDate>,
}

/// Summary statistics for a finished search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Summary {
    pub count: usize,
    /// Earliest known release date among the results.
    pub first_collaboration: Option<NaiveDate>,
    /// Latest known release date among the results.
    pub most_recent: Option<NaiveDate>,
    /// Human-readable time since `most_recent`, e.g. "3y 2m ago".
    pub since_last: Option<String>,
}

/// Everything a presentation layer needs to render a search.
#[derive(Debug, Clone)]
pub struct CollaborationReport {
    pub person1: Participant,
    pub person2: Participant,
    /// Sorted most recent first; undated entries last.
    pub collaborations: Vec<CandidatePair>,
    pub summary: Summary,
}

/// Progress events emitted while a search runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    ResolvingNames,
    GatheringCredits,
    ComparingAppearances {
        candidates: usize,
    },
    CheckingSeries {
        index: usize,
        total: usize,
        title: String,
    },
    SeriesConfirmed {
        title: String,
        episode: EpisodeMatch,
    },
    Finalizing,
}

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("could not find a person named \"{name}\"")]
    NotFound { name: String },
    #[error("HTTP {status} for {key}")]
    Http { status: u16, key: String },
    #[error("request failed for {key}: {message}")]
    Transport { key: String, message: String },
    #[error("invalid response body for {key}: {message}")]
    Decode { key: String, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("background task failed: {0}")]
    Task(String),
}

impl CoreError {
    /// Whether this is a network-level failure (HTTP status, transport or body).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CoreError::Http { .. } | CoreError::Transport { .. } | CoreError::Decode { .. }
        )
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        CoreError::Task(e.to_string())
    }
}

/// Order in which a series' seasons are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonOrder {
    Asc,
    /// Most recent season first.
    #[default]
    Desc,
}

impl std::str::FromStr for SeasonOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "oldest-first" => Ok(SeasonOrder::Asc),
            "desc" | "most-recent-first" => Ok(SeasonOrder::Desc),
            other => Err(format!("unknown season order: {other}")),
        }
    }
}

/// Controls for same-episode TV confirmation (speed/cost trade-off).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TvCheckConfig {
    /// Include season 0 ("Specials").
    pub include_specials: bool,
    /// Safety cap on seasons considered per series.
    pub max_seasons: usize,
    pub season_order: SeasonOrder,
    pub season_concurrency: usize,
    pub episode_concurrency: usize,
}

impl Default for TvCheckConfig {
    fn default() -> Self {
        Self {
            include_specials: false,
            max_seasons: 50,
            season_order: SeasonOrder::Desc,
            season_concurrency: 4,
            episode_concurrency: 6,
        }
    }
}

/// Configuration for the collaboration finder.
#[derive(Clone)]
pub struct Config {
    pub api_base_url: String,
    /// Bearer token sent with every request. Never part of a cache key.
    pub api_token: Option<String>,
    /// Append crew credits to each person's cast credits.
    pub include_crew: bool,
    /// Pass `include_adult=true` to person search.
    pub include_adult: bool,
    pub tv_check: TvCheckConfig,
    pub request_timeout_secs: u64,
    /// Proactive request pacing; `None` disables it.
    pub requests_per_second: Option<u32>,
    /// Path to the persistent SQLite cache (optional).
    pub cache_path: Option<PathBuf>,
    /// TTL in seconds for persistent cache entries. Default: 24 hours.
    pub cache_ttl_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .field("include_crew", &self.include_crew)
            .field("include_adult", &self.include_adult)
            .field("tv_check", &self.tv_check)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("requests_per_second", &self.requests_per_second)
            .field("cache_path", &self.cache_path)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            include_crew: false,
            include_adult: false,
            tv_check: TvCheckConfig::default(),
            request_timeout_secs: 15,
            requests_per_second: Some(40),
            cache_path: None,
            cache_ttl_secs: DEFAULT_TTL.as_secs(),
        }
    }
}

/// Build a [`ResponseCache`] from configuration.
///
/// If `cache_path` is set, opens a persistent SQLite-backed cache.
/// Otherwise, returns a volatile-only cache.
pub fn build_response_cache(
    cache_path: Option<&std::path::Path>,
    ttl_secs: u64,
) -> Arc<ResponseCache> {
    let ttl = Duration::from_secs(ttl_secs);
    if let Some(path) = cache_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match ResponseCache::open(path, ttl) {
            Ok(cache) => {
                tracing::info!(path = %path.display(), "opened persistent cache");
                return Arc::new(cache);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open cache, falling back to in-memory");
            }
        }
    }
    Arc::new(ResponseCache::new(ttl))
}

/// Build the filmography client described by `config` on top of the real
/// HTTP transport.
pub fn build_tmdb(config: &Config) -> Tmdb {
    let cache = build_response_cache(config.cache_path.as_deref(), config.cache_ttl_secs);
    let transport = Arc::new(ReqwestTransport::new(
        config.api_token.clone(),
        Duration::from_secs(config.request_timeout_secs),
    ));
    let limiter = config
        .requests_per_second
        .filter(|n| *n > 0)
        .map(|n| Arc::new(rate_limit::RequestPacer::per_second(n)));
    let fetcher = Fetcher::new(transport, cache, limiter);
    Tmdb::new(fetcher, config)
}
