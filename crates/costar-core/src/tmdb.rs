//! Filmography lookups against a TMDb-compatible API.
//!
//! Every method takes the caller's cancellation token and goes through the
//! shared [`Fetcher`], so repeated lookups across searches are served from
//! cache.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{FetchOptions, Fetcher};
use crate::{Config, CoreError, Credit, MediaType, PersonProfile, SeasonOrder, TvCheckConfig};

/// Title used when a credit has neither a title nor a name.
pub const UNTITLED: &str = "(untitled)";

/// Parse an upstream date (`YYYY-MM-DD`). Missing, empty or invalid dates are `None`.
pub fn parse_date(s: Option<&str>) -> Option<NaiveDate> {
    let s = s?.trim();
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// First non-empty string among the candidates.
fn first_present(candidates: &[&Option<String>]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

// ── Wire types (only the fields we consume) ─────────────────────────────

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<IdOnly>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: u64,
}

#[derive(Deserialize)]
struct CombinedCredits {
    #[serde(default)]
    cast: Vec<RawCredit>,
    #[serde(default)]
    crew: Vec<RawCredit>,
}

#[derive(Deserialize)]
struct RawCredit {
    id: u64,
    media_type: Option<String>,
    title: Option<String>,
    name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    character: Option<String>,
    job: Option<String>,
    poster_path: Option<String>,
}

impl RawCredit {
    fn into_credit(self) -> Option<Credit> {
        let media_type = match self.media_type.as_deref() {
            Some("movie") => MediaType::Movie,
            Some("tv") => MediaType::Tv,
            other => {
                tracing::trace!(id = self.id, media_type = ?other, "skipping credit without a known media type");
                return None;
            }
        };
        let date = first_present(&[&self.release_date, &self.first_air_date]);
        Some(Credit {
            id: self.id,
            media_type,
            title: first_present(&[&self.title, &self.name])
                .unwrap_or_else(|| UNTITLED.to_string()),
            release_date: parse_date(date.as_deref()),
            role: first_present(&[&self.character, &self.job]),
            poster_ref: first_present(&[&self.poster_path]),
        })
    }
}

#[derive(Deserialize)]
struct PersonDetails {
    id: u64,
    name: Option<String>,
    birthday: Option<String>,
}

#[derive(Deserialize)]
struct SeriesDetails {
    #[serde(default)]
    seasons: Vec<SeasonSummary>,
}

#[derive(Deserialize)]
struct SeasonSummary {
    season_number: Option<u32>,
}

#[derive(Deserialize)]
struct PeopleLists {
    #[serde(default)]
    cast: Vec<IdOnly>,
    #[serde(default)]
    guest_stars: Vec<IdOnly>,
    #[serde(default)]
    crew: Vec<IdOnly>,
}

impl PeopleLists {
    fn ids(self) -> HashSet<u64> {
        self.cast
            .into_iter()
            .chain(self.guest_stars)
            .chain(self.crew)
            .map(|p| p.id)
            .collect()
    }
}

#[derive(Deserialize)]
struct SeasonDetails {
    #[serde(default)]
    episodes: Vec<RawEpisode>,
}

#[derive(Deserialize)]
struct RawEpisode {
    episode_number: u32,
    air_date: Option<String>,
    name: Option<String>,
}

/// An episode as listed in a season.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeSummary {
    pub episode_number: u32,
    pub air_date: Option<NaiveDate>,
    pub name: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────────

/// Filmography client. Cheap to clone.
#[derive(Clone)]
pub struct Tmdb {
    fetcher: Fetcher,
    base_url: Arc<str>,
    include_crew: bool,
    include_adult: bool,
    tv_check: TvCheckConfig,
}

impl Tmdb {
    pub fn new(fetcher: Fetcher, config: &Config) -> Self {
        Self {
            fetcher,
            base_url: Arc::from(config.api_base_url.trim_end_matches('/')),
            include_crew: config.include_crew,
            include_adult: config.include_adult,
            tv_check: config.tv_check.clone(),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn tv_check(&self) -> &TvCheckConfig {
        &self.tv_check
    }

    // ── URL builders ────────────────────────────────────────────────────
    //
    // The URL is the cache key, so every parameter that changes the
    // response must appear in it.

    pub fn search_person_url(&self, name: &str) -> String {
        format!(
            "{}/search/person?query={}&include_adult={}",
            self.base_url,
            urlencoding::encode(name),
            self.include_adult
        )
    }

    pub fn combined_credits_url(&self, person_id: u64) -> String {
        format!("{}/person/{person_id}/combined_credits", self.base_url)
    }

    pub fn person_url(&self, person_id: u64) -> String {
        format!("{}/person/{person_id}", self.base_url)
    }

    pub fn tv_url(&self, tv_id: u64) -> String {
        format!("{}/tv/{tv_id}", self.base_url)
    }

    pub fn season_aggregate_url(&self, tv_id: u64, season: u32) -> String {
        format!(
            "{}/tv/{tv_id}/season/{season}/aggregate_credits",
            self.base_url
        )
    }

    pub fn season_url(&self, tv_id: u64, season: u32) -> String {
        format!("{}/tv/{tv_id}/season/{season}", self.base_url)
    }

    pub fn episode_credits_url(&self, tv_id: u64, season: u32, episode: u32) -> String {
        format!(
            "{}/tv/{tv_id}/season/{season}/episode/{episode}/credits",
            self.base_url
        )
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, CoreError> {
        self.fetcher
            .fetch_as(url, FetchOptions::default(), cancel)
            .await
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    /// Identifier of the first person-search result for `name`, if any.
    pub async fn resolve_person_id(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, CoreError> {
        let page: SearchPage = self.get(&self.search_person_url(name), cancel).await?;
        let id = page.results.first().map(|p| p.id);
        tracing::debug!(name, ?id, "resolved person");
        Ok(id)
    }

    /// Cast credits, followed by crew credits when `include_crew` is set.
    pub async fn combined_credits(
        &self,
        person_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Credit>, CoreError> {
        let raw: CombinedCredits = self
            .get(&self.combined_credits_url(person_id), cancel)
            .await?;
        let crew = if self.include_crew { raw.crew } else { Vec::new() };
        Ok(raw
            .cast
            .into_iter()
            .chain(crew)
            .filter_map(RawCredit::into_credit)
            .collect())
    }

    pub async fn profile(
        &self,
        person_id: u64,
        cancel: &CancellationToken,
    ) -> Result<PersonProfile, CoreError> {
        let details: PersonDetails = self.get(&self.person_url(person_id), cancel).await?;
        Ok(PersonProfile {
            id: details.id,
            name: details.name,
            birth_date: parse_date(details.birthday.as_deref()),
        })
    }

    /// Season numbers of a series in scan order, after the specials filter
    /// and the season cap.
    pub async fn season_numbers(
        &self,
        tv_id: u64,
        tv_check: &TvCheckConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>, CoreError> {
        let details: SeriesDetails = self.get(&self.tv_url(tv_id), cancel).await?;
        let mut seasons: Vec<u32> = details
            .seasons
            .into_iter()
            .map(|s| s.season_number.unwrap_or(0))
            .filter(|&n| tv_check.include_specials || n > 0)
            .collect();

        match tv_check.season_order {
            SeasonOrder::Desc => seasons.sort_unstable_by(|a, b| b.cmp(a)),
            SeasonOrder::Asc => seasons.sort_unstable(),
        }
        if tv_check.max_seasons > 0 {
            seasons.truncate(tv_check.max_seasons);
        }
        Ok(seasons)
    }

    /// Person ids in a season's aggregate cast and crew.
    pub async fn season_aggregate_ids(
        &self,
        tv_id: u64,
        season: u32,
        cancel: &CancellationToken,
    ) -> Result<HashSet<u64>, CoreError> {
        let lists: PeopleLists = self
            .get(&self.season_aggregate_url(tv_id, season), cancel)
            .await?;
        Ok(lists.ids())
    }

    pub async fn season_episodes(
        &self,
        tv_id: u64,
        season: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<EpisodeSummary>, CoreError> {
        let details: SeasonDetails = self.get(&self.season_url(tv_id, season), cancel).await?;
        Ok(details
            .episodes
            .into_iter()
            .map(|e| EpisodeSummary {
                episode_number: e.episode_number,
                air_date: parse_date(e.air_date.as_deref()),
                name: e.name.filter(|n| !n.is_empty()),
            })
            .collect())
    }

    /// Person ids in one episode's cast, guest stars and crew.
    pub async fn episode_credit_ids(
        &self,
        tv_id: u64,
        season: u32,
        episode: u32,
        cancel: &CancellationToken,
    ) -> Result<HashSet<u64>, CoreError> {
        let lists: PeopleLists = self
            .get(&self.episode_credits_url(tv_id, season, episode), cancel)
            .await?;
        Ok(lists.ids())
    }
}

impl std::fmt::Debug for Tmdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tmdb")
            .field("base_url", &self.base_url)
            .field("include_crew", &self.include_crew)
            .field("include_adult", &self.include_adult)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::fetcher::Transport;
    use crate::mock::{MockResponse, MockTransport};
    use serde_json::json;

    fn client(config: &Config) -> (Tmdb, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let fetcher = Fetcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(ResponseCache::default()),
            None,
        );
        (Tmdb::new(fetcher, config), transport)
    }

    fn mock_config() -> Config {
        Config {
            api_base_url: "http://mock/".into(),
            ..Config::default()
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parse_date_variants() {
        assert_eq!(parse_date(Some("2010-01-01")), Some(date("2010-01-01")));
        assert_eq!(
            parse_date(Some("2010-01-01T00:00:00Z")),
            Some(date("2010-01-01"))
        );
        assert_eq!(parse_date(Some("")), None);
        assert_eq!(parse_date(Some("not a date")), None);
        assert_eq!(parse_date(Some("2010-13-45")), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn search_url_encodes_name_and_adult_flag() {
        let (tmdb, _) = client(&mock_config());
        assert_eq!(
            tmdb.search_person_url("Renée Zellweger & co"),
            "http://mock/search/person?query=Ren%C3%A9e%20Zellweger%20%26%20co&include_adult=false"
        );

        let (adult, _) = client(&Config {
            include_adult: true,
            ..mock_config()
        });
        assert!(adult.search_person_url("x").ends_with("include_adult=true"));
    }

    #[tokio::test]
    async fn resolve_takes_first_result() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.search_person_url("Tom Hanks"),
            MockResponse::Json(json!({"results": [{"id": 31}, {"id": 999}]})),
        );
        transport.route(
            &tmdb.search_person_url("Nobody"),
            MockResponse::Json(json!({"results": []})),
        );
        let cancel = CancellationToken::new();

        assert_eq!(
            tmdb.resolve_person_id("Tom Hanks", &cancel).await.unwrap(),
            Some(31)
        );
        assert_eq!(tmdb.resolve_person_id("Nobody", &cancel).await.unwrap(), None);
    }

    fn credits_body() -> serde_json::Value {
        json!({
            "cast": [
                {"id": 1, "media_type": "movie", "title": "Big", "release_date": "1988-06-03",
                 "character": "Josh", "poster_path": "/big.jpg"},
                {"id": 2, "media_type": "tv", "name": "Show", "first_air_date": "2001-09-09",
                 "character": ""},
                {"id": 3, "media_type": "movie", "title": "", "release_date": ""},
                {"id": 4, "media_type": "person"}
            ],
            "crew": [
                {"id": 5, "media_type": "movie", "title": "Directed", "job": "Director"}
            ]
        })
    }

    #[tokio::test]
    async fn combined_credits_cast_only_by_default() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.combined_credits_url(31),
            MockResponse::Json(credits_body()),
        );

        let credits = tmdb
            .combined_credits(31, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credits.len(), 3);
        assert_eq!(credits[0].title, "Big");
        assert_eq!(credits[0].role.as_deref(), Some("Josh"));
        assert_eq!(credits[0].poster_ref.as_deref(), Some("/big.jpg"));
        assert_eq!(credits[0].release_date, Some(date("1988-06-03")));

        assert_eq!(credits[1].media_type, MediaType::Tv);
        assert_eq!(credits[1].title, "Show");
        assert_eq!(credits[1].release_date, Some(date("2001-09-09")));
        assert_eq!(credits[1].role, None);

        assert_eq!(credits[2].title, UNTITLED);
        assert_eq!(credits[2].release_date, None);
    }

    #[tokio::test]
    async fn combined_credits_appends_crew_when_enabled() {
        let (tmdb, transport) = client(&Config {
            include_crew: true,
            ..mock_config()
        });
        transport.route(
            &tmdb.combined_credits_url(31),
            MockResponse::Json(credits_body()),
        );

        let credits = tmdb
            .combined_credits(31, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credits.len(), 4);
        let last = credits.last().unwrap();
        assert_eq!(last.id, 5);
        assert_eq!(last.role.as_deref(), Some("Director"));
    }

    #[tokio::test]
    async fn profile_parses_birthday() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.person_url(31),
            MockResponse::Json(json!({"id": 31, "name": "Tom Hanks", "birthday": "1956-07-09"})),
        );
        transport.route(
            &tmdb.person_url(32),
            MockResponse::Json(json!({"id": 32, "birthday": null})),
        );
        let cancel = CancellationToken::new();

        let p = tmdb.profile(31, &cancel).await.unwrap();
        assert_eq!(p.birth_date, Some(date("1956-07-09")));
        assert_eq!(p.name.as_deref(), Some("Tom Hanks"));
        assert_eq!(tmdb.profile(32, &cancel).await.unwrap().birth_date, None);
    }

    #[tokio::test]
    async fn season_numbers_filter_order_and_cap() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.tv_url(99),
            MockResponse::Json(json!({"seasons": [
                {"season_number": 0}, {"season_number": 1}, {"season_number": 3},
                {"season_number": 2}, {}
            ]})),
        );
        let cancel = CancellationToken::new();

        let default = TvCheckConfig::default();
        assert_eq!(
            tmdb.season_numbers(99, &default, &cancel).await.unwrap(),
            vec![3, 2, 1]
        );

        let asc_with_specials = TvCheckConfig {
            include_specials: true,
            season_order: SeasonOrder::Asc,
            ..TvCheckConfig::default()
        };
        assert_eq!(
            tmdb.season_numbers(99, &asc_with_specials, &cancel)
                .await
                .unwrap(),
            vec![0, 0, 1, 2, 3]
        );

        let capped = TvCheckConfig {
            max_seasons: 2,
            ..TvCheckConfig::default()
        };
        assert_eq!(
            tmdb.season_numbers(99, &capped, &cancel).await.unwrap(),
            vec![3, 2]
        );
    }

    #[tokio::test]
    async fn episode_credit_ids_combine_all_lists() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.episode_credits_url(99, 2, 5),
            MockResponse::Json(json!({
                "cast": [{"id": 1}],
                "guest_stars": [{"id": 2}],
                "crew": [{"id": 3}]
            })),
        );

        let ids = tmdb
            .episode_credit_ids(99, 2, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids, HashSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn season_episodes_parse() {
        let (tmdb, transport) = client(&mock_config());
        transport.route(
            &tmdb.season_url(99, 2),
            MockResponse::Json(json!({"episodes": [
                {"episode_number": 1, "air_date": "2019-01-01", "name": "Pilot"},
                {"episode_number": 2, "air_date": null, "name": ""}
            ]})),
        );

        let eps = tmdb
            .season_episodes(99, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].air_date, Some(date("2019-01-01")));
        assert_eq!(eps[0].name.as_deref(), Some("Pilot"));
        assert_eq!(eps[1].air_date, None);
        assert_eq!(eps[1].name, None);
    }
}
