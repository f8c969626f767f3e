//! End-to-end collaboration searches against a scripted transport.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use costar_core::mock::{MockResponse, MockTransport};
use costar_core::{
    Config, CoreError, FetchOptions, Fetcher, MediaType, ProgressEvent, ResponseCache, Tmdb,
    Transport, find_collaborations,
};

const ANN: u64 = 1;
const BOB: u64 = 2;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn today() -> NaiveDate {
    date("2024-06-15")
}

fn client(cache: Arc<ResponseCache>) -> (Tmdb, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let fetcher = Fetcher::new(Arc::clone(&transport) as Arc<dyn Transport>, cache, None);
    let config = Config {
        api_base_url: "http://mock".into(),
        ..Config::default()
    };
    (Tmdb::new(fetcher, &config), transport)
}

fn people(ids: &[u64]) -> Value {
    json!({ "cast": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>() })
}

/// Ann and Bob share:
/// - movie 10 (2010), also present as tv 10 for Ann only,
/// - undated movie 11,
/// - series 99, where they meet in S2E5 (aired 2019-02-05),
/// - series 77, where they never share an episode.
fn script_world(tmdb: &Tmdb, transport: &MockTransport) {
    for (name, id) in [("Ann", ANN), ("Bob", BOB)] {
        transport.route(
            &tmdb.search_person_url(name),
            MockResponse::Json(json!({"results": [{"id": id}, {"id": 500 + id}]})),
        );
    }
    transport.route(
        &tmdb.person_url(ANN),
        MockResponse::Json(json!({"id": ANN, "name": "Ann", "birthday": "1980-03-01"})),
    );
    transport.route(
        &tmdb.person_url(BOB),
        MockResponse::Json(json!({"id": BOB, "name": "Bob", "birthday": null})),
    );

    transport.route(
        &tmdb.combined_credits_url(ANN),
        MockResponse::Json(json!({"cast": [
            {"id": 10, "media_type": "movie", "title": "Shared Movie", "release_date": "2010-01-01", "character": "Lead"},
            {"id": 10, "media_type": "tv", "name": "Same Id Show", "first_air_date": "2011-01-01"},
            {"id": 11, "media_type": "movie", "title": "Undated", "release_date": ""},
            {"id": 99, "media_type": "tv", "name": "Long Show", "first_air_date": "2005-01-01", "character": "Host"},
            {"id": 77, "media_type": "tv", "name": "Other Show", "first_air_date": "2000-01-01"},
            {"id": 20, "media_type": "movie", "title": "Ann Only", "release_date": "2015-01-01"}
        ]})),
    );
    transport.route(
        &tmdb.combined_credits_url(BOB),
        MockResponse::Json(json!({"cast": [
            {"id": 10, "media_type": "movie", "title": "Shared Movie", "release_date": "2010-01-01", "character": "Sidekick"},
            {"id": 11, "media_type": "movie", "title": "Undated"},
            {"id": 99, "media_type": "tv", "name": "Long Show", "character": "Guest"},
            {"id": 77, "media_type": "tv", "name": "Other Show"},
            {"id": 30, "media_type": "movie", "title": "Bob Only", "release_date": "2020-01-01"}
        ]})),
    );

    // Series 99: season 1 aggregate lacks Bob, season 2 has both.
    transport.route(
        &tmdb.tv_url(99),
        MockResponse::Json(json!({"seasons": [{"season_number": 1}, {"season_number": 2}]})),
    );
    transport.route(
        &tmdb.season_aggregate_url(99, 1),
        MockResponse::Json(people(&[ANN])),
    );
    transport.route(
        &tmdb.season_aggregate_url(99, 2),
        MockResponse::Json(people(&[ANN, BOB])),
    );
    let episodes: Vec<Value> = (1..=6)
        .map(|e| json!({"episode_number": e, "air_date": format!("2019-02-{e:02}"), "name": format!("Episode {e}")}))
        .collect();
    transport.route(
        &tmdb.season_url(99, 2),
        MockResponse::Json(json!({"episodes": episodes})),
    );
    for e in 1..=6 {
        let cast: &[u64] = if e == 5 { &[ANN, BOB] } else { &[ANN] };
        transport.route(
            &tmdb.episode_credits_url(99, 2, e),
            MockResponse::Json(people(cast)),
        );
    }

    // Series 77: aggregate unavailable, single episode without Bob.
    transport.route(
        &tmdb.tv_url(77),
        MockResponse::Json(json!({"seasons": [{"season_number": 1}]})),
    );
    transport.route(&tmdb.season_aggregate_url(77, 1), MockResponse::Status(404));
    transport.route(
        &tmdb.season_url(77, 1),
        MockResponse::Json(json!({"episodes": [{"episode_number": 1}]})),
    );
    transport.route(
        &tmdb.episode_credits_url(77, 1, 1),
        MockResponse::Json(people(&[ANN])),
    );
}

#[tokio::test]
async fn full_search_confirms_series_and_sorts_results() {
    let (tmdb, transport) = client(Arc::new(ResponseCache::default()));
    script_world(&tmdb, &transport);
    let events = Mutex::new(Vec::new());

    let report = find_collaborations(
        &tmdb,
        " Ann ",
        "Bob",
        today(),
        &CancellationToken::new(),
        &|e| events.lock().unwrap().push(e),
    )
    .await
    .unwrap();

    let keys: Vec<(u64, MediaType)> = report
        .collaborations
        .iter()
        .map(|c| (c.id, c.media_type))
        .collect();
    assert_eq!(
        keys,
        vec![(99, MediaType::Tv), (10, MediaType::Movie), (11, MediaType::Movie)]
    );

    let series = &report.collaborations[0];
    let episode = series.episode.as_ref().unwrap();
    assert_eq!((episode.season_number, episode.episode_number), (2, 5));
    assert_eq!(episode.episode_name.as_deref(), Some("Episode 5"));
    assert_eq!(series.release_date, Some(date("2019-02-05")));
    assert_eq!(series.person1_age, Some(38));
    assert_eq!(series.person2_age, None);
    assert_eq!(series.person1_role.as_deref(), Some("Host"));
    assert_eq!(series.person2_role.as_deref(), Some("Guest"));

    let movie = &report.collaborations[1];
    assert!(movie.episode.is_none());
    assert_eq!(movie.person1_age, Some(29));
    assert_eq!(movie.person2_role.as_deref(), Some("Sidekick"));

    assert_eq!(report.person1.name, "Ann");
    assert_eq!(report.person1.birth_date, Some(date("1980-03-01")));
    assert_eq!(report.person2.id, BOB);

    assert_eq!(report.summary.count, 3);
    assert_eq!(report.summary.first_collaboration, Some(date("2010-01-01")));
    assert_eq!(report.summary.most_recent, Some(date("2019-02-05")));
    assert_eq!(report.summary.since_last.as_deref(), Some("5y 4m ago"));

    // Season 1 of series 99 was ruled out by its aggregate credits.
    assert_eq!(transport.call_count(&tmdb.season_url(99, 1)), 0);
    // Series 77 was scanned despite its aggregate failing.
    assert_eq!(transport.call_count(&tmdb.episode_credits_url(77, 1, 1)), 1);

    let events = events.into_inner().unwrap();
    assert_eq!(
        events[..3],
        [
            ProgressEvent::ResolvingNames,
            ProgressEvent::GatheringCredits,
            ProgressEvent::ComparingAppearances { candidates: 4 },
        ]
    );
    assert!(events.contains(&ProgressEvent::CheckingSeries {
        index: 2,
        total: 2,
        title: "Other Show".into(),
    }));
    assert_eq!(events.last(), Some(&ProgressEvent::Finalizing));
}

#[tokio::test]
async fn repeated_search_is_served_from_cache() {
    let (tmdb, transport) = client(Arc::new(ResponseCache::default()));
    script_world(&tmdb, &transport);
    let cancel = CancellationToken::new();

    find_collaborations(&tmdb, "Ann", "Bob", today(), &cancel, &|_| {})
        .await
        .unwrap();
    let after_first = transport.total_calls();
    find_collaborations(&tmdb, "Bob", "Ann", today(), &cancel, &|_| {})
        .await
        .unwrap();

    // Failed responses are never cached, so the only new request is the
    // unavailable aggregate of series 77.
    let failed_aggregate = tmdb.season_aggregate_url(77, 1);
    assert_eq!(transport.total_calls(), after_first + 1);
    assert_eq!(transport.call_count(&failed_aggregate), 2);
    assert_eq!(tmdb.fetcher().network_calls() as usize, transport.total_calls());
}

#[tokio::test]
async fn unknown_person_is_not_found() {
    let (tmdb, transport) = client(Arc::new(ResponseCache::default()));
    script_world(&tmdb, &transport);
    transport.route(
        &tmdb.search_person_url("Zed"),
        MockResponse::Json(json!({"results": []})),
    );

    let err = find_collaborations(
        &tmdb,
        "Ann",
        "Zed",
        today(),
        &CancellationToken::new(),
        &|_| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoreError::NotFound { ref name } if name == "Zed"));
    assert_eq!(transport.call_count(&tmdb.combined_credits_url(ANN)), 0);
}

#[tokio::test]
async fn blank_name_is_rejected_without_network() {
    let (tmdb, transport) = client(Arc::new(ResponseCache::default()));
    let err = find_collaborations(
        &tmdb,
        "Ann",
        "   ",
        today(),
        &CancellationToken::new(),
        &|_| {},
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
    assert_eq!(transport.total_calls(), 0);
}

#[tokio::test]
async fn network_error_discards_partial_results() {
    let (tmdb, transport) = client(Arc::new(ResponseCache::default()));
    script_world(&tmdb, &transport);
    transport.route(&tmdb.season_url(99, 2), MockResponse::Status(503));

    let err = find_collaborations(
        &tmdb,
        "Ann",
        "Bob",
        today(),
        &CancellationToken::new(),
        &|_| {},
    )
    .await
    .unwrap_err();

    match err {
        CoreError::Http { status, key } => {
            assert_eq!(status, 503);
            assert_eq!(key, tmdb.season_url(99, 2));
        }
        other => panic!("expected Http, got {other:?}"),
    }
}

// ── Persistent tier ─────────────────────────────────────────────────────

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_db() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("costar_search_flow_{}_{}", std::process::id(), id))
        .join("cache.db")
}

#[tokio::test]
async fn persistent_cache_survives_restart() {
    let path = temp_db();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let url = "http://mock/person/1";

    {
        let cache = Arc::new(ResponseCache::open(&path, Duration::from_secs(3600)).unwrap());
        let (tmdb, transport) = client(cache);
        transport.route(url, MockResponse::Json(json!({"id": 1})));
        tmdb.fetcher()
            .fetch_json(url, FetchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.call_count(url), 1);
    }

    let cache = Arc::new(ResponseCache::open(&path, Duration::from_secs(3600)).unwrap());
    let (tmdb, transport) = client(cache);
    let value = tmdb
        .fetcher()
        .fetch_json(url, FetchOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(value["id"], 1);
    assert_eq!(transport.total_calls(), 0);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn expired_entry_triggers_one_fresh_call() {
    let path = temp_db();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let url = "http://mock/person/2";
    let short = Duration::from_millis(20);

    {
        let cache = Arc::new(ResponseCache::open(&path, short).unwrap());
        let (tmdb, transport) = client(cache);
        transport.route(url, MockResponse::Json(json!({"v": "old"})));
        tmdb.fetcher()
            .fetch_json(url, FetchOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(50));

    let cache = Arc::new(ResponseCache::open(&path, short).unwrap());
    let (tmdb, transport) = client(Arc::clone(&cache));
    transport.route(url, MockResponse::Json(json!({"v": "new"})));
    let value = tmdb
        .fetcher()
        .fetch_json(url, FetchOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(value["v"], "new");
    assert_eq!(transport.call_count(url), 1);
    drop(tmdb);
    drop(cache);

    // The refreshed row is on disk with a new timestamp.
    let long = ResponseCache::open(&path, Duration::from_secs(3600)).unwrap();
    assert_eq!(long.get(url, true).unwrap()["v"], "new");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn opting_out_of_persistence_leaves_disk_untouched() {
    let path = temp_db();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let url = "http://mock/person/3";

    let cache = Arc::new(ResponseCache::open(&path, Duration::from_secs(3600)).unwrap());
    let (tmdb, transport) = client(Arc::clone(&cache));
    transport.route(url, MockResponse::Json(json!({"id": 3})));
    tmdb.fetcher()
        .fetch_json(url, FetchOptions { persist: false }, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cache.disk_len(), 0);
    assert!(cache.peek_volatile(url).is_some());

    let _ = std::fs::remove_file(&path);
}
