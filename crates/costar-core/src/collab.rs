//! Collaboration search: intersect two filmographies, confirm shared TV
//! series down to a single episode, then merge, sort and summarize.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use tokio_util::sync::CancellationToken;

use crate::overlap::confirm_tv_overlap;
use crate::tmdb::{Tmdb, UNTITLED};
use crate::{
    CandidatePair, CollaborationReport, CoreError, Credit, CreditKey, EpisodeMatch, MediaType,
    Participant, ProgressEvent, Summary,
};

/// Find every title `name1` and `name2` are both credited in.
///
/// Movies count as soon as both people are credited. A series counts only
/// once an episode crediting both is found; its date then becomes that
/// episode's air date. `today` anchors the "since last" summary.
pub async fn find_collaborations(
    tmdb: &Tmdb,
    name1: &str,
    name2: &str,
    today: NaiveDate,
    cancel: &CancellationToken,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
) -> Result<CollaborationReport, CoreError> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    let (name1, name2) = (name1.trim(), name2.trim());
    for name in [name1, name2] {
        if name.is_empty() {
            return Err(CoreError::NotFound {
                name: name.to_string(),
            });
        }
    }

    // 1) Resolve ids
    progress(ProgressEvent::ResolvingNames);
    let (id1, id2) = tokio::try_join!(
        tmdb.resolve_person_id(name1, cancel),
        tmdb.resolve_person_id(name2, cancel),
    )?;
    let id1 = id1.ok_or_else(|| CoreError::NotFound {
        name: name1.to_string(),
    })?;
    let id2 = id2.ok_or_else(|| CoreError::NotFound {
        name: name2.to_string(),
    })?;

    // 2) Credits and profiles
    progress(ProgressEvent::GatheringCredits);
    let (credits1, credits2, profile1, profile2) = tokio::try_join!(
        tmdb.combined_credits(id1, cancel),
        tmdb.combined_credits(id2, cancel),
        tmdb.profile(id1, cancel),
        tmdb.profile(id2, cancel),
    )?;

    // 3) Intersect
    let (birth1, birth2) = (profile1.birth_date, profile2.birth_date);
    let candidates = intersect_credits(&credits1, &credits2, birth1, birth2);
    progress(ProgressEvent::ComparingAppearances {
        candidates: candidates.len(),
    });

    // 4) Confirm series, one at a time
    let (tv_candidates, movies): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.media_type == MediaType::Tv);

    let total = tv_candidates.len();
    let mut confirmed = Vec::with_capacity(total);
    for (index, mut candidate) in tv_candidates.into_iter().enumerate() {
        progress(ProgressEvent::CheckingSeries {
            index: index + 1,
            total,
            title: candidate.title.clone(),
        });
        let Some(episode) =
            confirm_tv_overlap(tmdb, candidate.id, id1, id2, tmdb.tv_check(), cancel).await?
        else {
            tracing::debug!(tv_id = candidate.id, title = %candidate.title, "no shared episode");
            continue;
        };
        progress(ProgressEvent::SeriesConfirmed {
            title: candidate.title.clone(),
            episode: episode.clone(),
        });
        attach_episode(&mut candidate, episode, birth1, birth2);
        confirmed.push(candidate);
    }

    // 5) Merge and summarize
    progress(ProgressEvent::Finalizing);
    let collaborations = merge_and_sort(movies, confirmed);
    let summary = summarize(&collaborations, today);
    tracing::info!(
        person1 = id1,
        person2 = id2,
        count = summary.count,
        network_calls = tmdb.fetcher().network_calls(),
        "collaboration search finished"
    );

    Ok(CollaborationReport {
        person1: Participant {
            id: id1,
            name: name1.to_string(),
            birth_date: birth1,
        },
        person2: Participant {
            id: id2,
            name: name2.to_string(),
            birth_date: birth2,
        },
        collaborations,
        summary,
    })
}

/// Pair up the credits present in both lists, keyed by `(id, media_type)`.
///
/// Values come from the first person's credit where it has them. If the
/// first list repeats a key, its last occurrence is used.
pub fn intersect_credits(
    first: &[Credit],
    second: &[Credit],
    birth1: Option<NaiveDate>,
    birth2: Option<NaiveDate>,
) -> Vec<CandidatePair> {
    let by_key: HashMap<CreditKey, &Credit> = first.iter().map(|c| (c.key(), c)).collect();

    second
        .iter()
        .filter_map(|c2| {
            let c1 = by_key.get(&c2.key())?;
            let title = if c1.title == UNTITLED {
                c2.title.clone()
            } else {
                c1.title.clone()
            };
            let release_date = c1.release_date.or(c2.release_date);
            Some(CandidatePair {
                id: c1.id,
                media_type: c1.media_type,
                title,
                release_date,
                person1_role: c1.role.clone(),
                person2_role: c2.role.clone(),
                person1_age: age_at(birth1, release_date),
                person2_age: age_at(birth2, release_date),
                poster_ref: c1.poster_ref.clone().or_else(|| c2.poster_ref.clone()),
                episode: None,
            })
        })
        .collect()
}

/// Attach a confirmed episode, moving the date to its air date when known.
fn attach_episode(
    candidate: &mut CandidatePair,
    episode: EpisodeMatch,
    birth1: Option<NaiveDate>,
    birth2: Option<NaiveDate>,
) {
    if let Some(aired) = episode.air_date {
        candidate.release_date = Some(aired);
    }
    candidate.person1_age = age_at(birth1, candidate.release_date);
    candidate.person2_age = age_at(birth2, candidate.release_date);
    candidate.episode = Some(episode);
}

/// Concatenate, drop repeated keys (the last entry wins), and sort most
/// recent first with undated entries at the end.
pub fn merge_and_sort(
    movies: Vec<CandidatePair>,
    confirmed_tv: Vec<CandidatePair>,
) -> Vec<CandidatePair> {
    let mut merged: Vec<CandidatePair> = Vec::with_capacity(movies.len() + confirmed_tv.len());
    let mut slots: HashMap<CreditKey, usize> = HashMap::new();

    for entry in movies.into_iter().chain(confirmed_tv) {
        match slots.get(&entry.key()) {
            Some(&i) => merged[i] = entry,
            None => {
                slots.insert(entry.key(), merged.len());
                merged.push(entry);
            }
        }
    }

    // `None < Some(_)`, so a descending sort puts undated entries last.
    merged.sort_by(|a, b| b.release_date.cmp(&a.release_date));
    merged
}

pub fn summarize(entries: &[CandidatePair], today: NaiveDate) -> Summary {
    let dates = entries.iter().filter_map(|e| e.release_date);
    let first_collaboration = dates.clone().min();
    let most_recent = dates.max();
    Summary {
        count: entries.len(),
        first_collaboration,
        most_recent,
        since_last: most_recent.map(|d| format_since(d, today)),
    }
}

/// Completed years between `birth` and `at`.
pub fn age_at(birth: Option<NaiveDate>, at: Option<NaiveDate>) -> Option<i32> {
    let (birth, at) = (birth?, at?);
    let mut age = at.year() - birth.year();
    if (at.month(), at.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    Some(age)
}

/// Elapsed time from `date` to `today`, e.g. `"3y 2m ago"`, `"5m ago"`,
/// `"2w ago"`, `"4d ago"`.
pub fn format_since(date: NaiveDate, today: NaiveDate) -> String {
    let days = (today - date).num_days();
    if days < 0 {
        return "in the future".to_string();
    }

    let d = days as f64;
    let years = (d / 365.25).floor() as i64;
    let months = ((d % 365.25) / 30.44).floor() as i64;

    if years >= 1 {
        format!("{years}y {months}m ago")
    } else if months >= 1 {
        format!("{months}m ago")
    } else if days >= 7 {
        format!("{}w ago", days / 7)
    } else {
        format!("{days}d ago")
    }
}
