use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Config, SeasonOrder};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: Option<ApiConfig>,
    pub search: Option<SearchConfig>,
    pub tv_check: Option<TvCheckSection>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
    /// 0 disables proactive pacing.
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    pub include_crew: Option<bool>,
    pub include_adult: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TvCheckSection {
    pub include_specials: Option<bool>,
    pub max_seasons: Option<usize>,
    /// `"desc"` (most recent first) or `"asc"`.
    pub season_order: Option<String>,
    pub season_concurrency: Option<usize>,
    pub episode_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// Platform config directory path: `<config_dir>/costar/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("costar").join("config.toml"))
}

/// Default persistent cache location: `<cache_dir>/costar/responses.db`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("costar").join("responses.db"))
}

/// Load config by cascading CWD `.costar.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".costar.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Field from `overlay`'s section if set, otherwise from `base`'s.
fn pick<S, T>(overlay: &Option<S>, base: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (b, o) = (&base, &overlay);
    ConfigFile {
        api: Some(ApiConfig {
            base_url: pick(&o.api, &b.api, |a| a.base_url.clone()),
            token: pick(&o.api, &b.api, |a| a.token.clone()),
            timeout_secs: pick(&o.api, &b.api, |a| a.timeout_secs),
            requests_per_second: pick(&o.api, &b.api, |a| a.requests_per_second),
        }),
        search: Some(SearchConfig {
            include_crew: pick(&o.search, &b.search, |s| s.include_crew),
            include_adult: pick(&o.search, &b.search, |s| s.include_adult),
        }),
        tv_check: Some(TvCheckSection {
            include_specials: pick(&o.tv_check, &b.tv_check, |t| t.include_specials),
            max_seasons: pick(&o.tv_check, &b.tv_check, |t| t.max_seasons),
            season_order: pick(&o.tv_check, &b.tv_check, |t| t.season_order.clone()),
            season_concurrency: pick(&o.tv_check, &b.tv_check, |t| t.season_concurrency),
            episode_concurrency: pick(&o.tv_check, &b.tv_check, |t| t.episode_concurrency),
        }),
        cache: Some(CacheConfig {
            path: pick(&o.cache, &b.cache, |c| c.path.clone()),
            ttl_secs: pick(&o.cache, &b.cache, |c| c.ttl_secs),
        }),
    }
}

impl ConfigFile {
    /// Overwrite the fields of `config` that this file sets.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref api) = self.api {
            if let Some(ref url) = api.base_url {
                config.api_base_url = url.clone();
            }
            if let Some(ref token) = api.token {
                config.api_token = Some(token.clone());
            }
            if let Some(secs) = api.timeout_secs {
                config.request_timeout_secs = secs;
            }
            if let Some(rps) = api.requests_per_second {
                config.requests_per_second = (rps > 0).then_some(rps);
            }
        }

        if let Some(ref search) = self.search {
            if let Some(v) = search.include_crew {
                config.include_crew = v;
            }
            if let Some(v) = search.include_adult {
                config.include_adult = v;
            }
        }

        if let Some(ref tv) = self.tv_check {
            let target = &mut config.tv_check;
            if let Some(v) = tv.include_specials {
                target.include_specials = v;
            }
            if let Some(v) = tv.max_seasons {
                target.max_seasons = v;
            }
            if let Some(ref order) = tv.season_order {
                match order.parse::<SeasonOrder>() {
                    Ok(o) => target.season_order = o,
                    Err(e) => tracing::warn!(error = %e, "keeping default season order"),
                }
            }
            if let Some(v) = tv.season_concurrency {
                target.season_concurrency = v.max(1);
            }
            if let Some(v) = tv.episode_concurrency {
                target.episode_concurrency = v.max(1);
            }
        }

        if let Some(ref cache) = self.cache {
            if let Some(ref path) = cache.path {
                config.cache_path = Some(PathBuf::from(path));
            }
            if let Some(ttl) = cache.ttl_secs {
                config.cache_ttl_secs = ttl;
            }
        }
    }
}

impl From<&Config> for ConfigFile {
    /// Every setting spelled out, for writing a starter config file.
    fn from(config: &Config) -> Self {
        let order = match config.tv_check.season_order {
            SeasonOrder::Asc => "asc",
            SeasonOrder::Desc => "desc",
        };
        ConfigFile {
            api: Some(ApiConfig {
                base_url: Some(config.api_base_url.clone()),
                token: config.api_token.clone(),
                timeout_secs: Some(config.request_timeout_secs),
                requests_per_second: Some(config.requests_per_second.unwrap_or(0)),
            }),
            search: Some(SearchConfig {
                include_crew: Some(config.include_crew),
                include_adult: Some(config.include_adult),
            }),
            tv_check: Some(TvCheckSection {
                include_specials: Some(config.tv_check.include_specials),
                max_seasons: Some(config.tv_check.max_seasons),
                season_order: Some(order.to_string()),
                season_concurrency: Some(config.tv_check.season_concurrency),
                episode_concurrency: Some(config.tv_check.episode_concurrency),
            }),
            cache: Some(CacheConfig {
                path: config
                    .cache_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                ttl_secs: Some(config.cache_ttl_secs),
            }),
        }
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to_path(config, &path)?;
    Ok(path)
}

/// Save a config to a specific path, creating parent directories.
pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}
