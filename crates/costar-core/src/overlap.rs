//! Same-episode confirmation for a series two people are both credited in.
//!
//! A shared series credit only means both people appeared somewhere in the
//! show. To confirm a real overlap we look for one episode whose credits
//! list both of them:
//!
//! 1. list the series' seasons (specials filter, cap, scan order),
//! 2. pre-filter each season on its aggregate credits, scanning seasons
//!    concurrently,
//! 3. scan the surviving seasons episode by episode, concurrently.
//!
//! The first episode recorded wins. Workers check the shared result cell
//! before starting a new fetch, so the scan winds down soon after a match;
//! fetches already in flight are allowed to finish. Because seasons run
//! concurrently, which match is reported when several seasons contain one
//! depends on completion order.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::scheduler::map_limit;
use crate::tmdb::{EpisodeSummary, Tmdb};
use crate::{CoreError, EpisodeMatch, TvCheckConfig};

/// Find an episode of `tv_id` in which both people are credited.
///
/// Returns `Ok(None)` when no scanned season contains a shared episode.
pub async fn confirm_tv_overlap(
    tmdb: &Tmdb,
    tv_id: u64,
    person1: u64,
    person2: u64,
    tv_check: &TvCheckConfig,
    cancel: &CancellationToken,
) -> Result<Option<EpisodeMatch>, CoreError> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let seasons = tmdb.season_numbers(tv_id, tv_check, cancel).await?;
    tracing::debug!(tv_id, seasons = seasons.len(), "checking series for a shared episode");

    let found: Arc<OnceLock<EpisodeMatch>> = Arc::new(OnceLock::new());
    let scan = SeasonScan {
        tmdb: tmdb.clone(),
        tv_id,
        person1,
        person2,
        episode_concurrency: tv_check.episode_concurrency,
        found: Arc::clone(&found),
        cancel: cancel.clone(),
    };

    map_limit(seasons, tv_check.season_concurrency, move |season, _| {
        let scan = scan.clone();
        async move { scan.season(season).await }
    })
    .await?;

    let result = found.get().cloned();
    if let Some(ref ep) = result {
        tracing::debug!(
            tv_id,
            season = ep.season_number,
            episode = ep.episode_number,
            "shared episode found"
        );
    }
    Ok(result)
}

#[derive(Clone)]
struct SeasonScan {
    tmdb: Tmdb,
    tv_id: u64,
    person1: u64,
    person2: u64,
    episode_concurrency: usize,
    found: Arc<OnceLock<EpisodeMatch>>,
    cancel: CancellationToken,
}

impl SeasonScan {
    /// Whether to stop before starting more work.
    fn should_stop(&self) -> Result<bool, CoreError> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(self.found.get().is_some())
    }

    async fn season(self, season: u32) -> Result<(), CoreError> {
        if self.should_stop()? {
            return Ok(());
        }
        if !self.season_contains_both(season).await? {
            tracing::trace!(tv_id = self.tv_id, season, "season skipped by aggregate credits");
            return Ok(());
        }
        if self.should_stop()? {
            return Ok(());
        }

        let episodes = self
            .tmdb
            .season_episodes(self.tv_id, season, &self.cancel)
            .await?;
        let limit = self.episode_concurrency;
        map_limit(episodes, limit, move |episode, _| {
            let scan = self.clone();
            async move { scan.episode(season, episode).await }
        })
        .await?;
        Ok(())
    }

    /// Aggregate pre-filter. An unavailable aggregate counts as a match so
    /// the season is still scanned.
    async fn season_contains_both(&self, season: u32) -> Result<bool, CoreError> {
        match self
            .tmdb
            .season_aggregate_ids(self.tv_id, season, &self.cancel)
            .await
        {
            Ok(ids) => Ok(ids.contains(&self.person1) && ids.contains(&self.person2)),
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) => {
                tracing::debug!(
                    tv_id = self.tv_id,
                    season,
                    error = %e,
                    "aggregate credits unavailable, scanning episodes"
                );
                Ok(true)
            }
        }
    }

    async fn episode(self, season: u32, episode: EpisodeSummary) -> Result<(), CoreError> {
        if self.should_stop()? {
            return Ok(());
        }
        let ids = self
            .tmdb
            .episode_credit_ids(self.tv_id, season, episode.episode_number, &self.cancel)
            .await?;
        if ids.contains(&self.person1) && ids.contains(&self.person2) {
            // A concurrent worker may have recorded its match first.
            let _ = self.found.set(EpisodeMatch {
                season_number: season,
                episode_number: episode.episode_number,
                air_date: episode.air_date,
                episode_name: episode.name,
            });
        }
        Ok(())
    }
}
