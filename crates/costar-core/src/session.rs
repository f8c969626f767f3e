//! Ownership of the "current search" cancellation token.
//!
//! Starting a search swaps in a fresh token and signals the previous one, so
//! at most one search is ever live. A superseded search still runs until its
//! next suspension point, but neither its progress events nor its result
//! reach the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::collab::find_collaborations;
use crate::tmdb::Tmdb;
use crate::{CollaborationReport, CoreError, ProgressEvent};

/// How a search ended, from the caller's point of view.
#[derive(Debug)]
pub enum SearchOutcome {
    Completed(CollaborationReport),
    /// One of the names matched nobody.
    NotFound { name: String },
    /// Network or task failure. Partial results are discarded.
    Failed(CoreError),
    /// A newer search started, or the search was cancelled. Not an error.
    Superseded,
}

pub struct SearchSession {
    tmdb: Tmdb,
    current: ArcSwap<CancellationToken>,
    running: AtomicUsize,
}

/// Counts a search as running until dropped, however it ends.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SearchSession {
    pub fn new(tmdb: Tmdb) -> Self {
        Self {
            tmdb,
            current: ArcSwap::from_pointee(CancellationToken::new()),
            running: AtomicUsize::new(0),
        }
    }

    pub fn tmdb(&self) -> &Tmdb {
        &self.tmdb
    }

    /// Install a fresh token and cancel the one it replaces.
    pub fn begin(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        let previous = self.current.swap(Arc::new(fresh.clone()));
        previous.cancel();
        fresh
    }

    /// Cancel whatever search is running without starting a new one.
    pub fn cancel_current(&self) {
        self.current.load().cancel();
    }

    /// Whether any search, superseded or not, has yet to return.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    /// Run a search that supersedes any search already in progress.
    pub async fn search(
        &self,
        name1: &str,
        name2: &str,
        today: NaiveDate,
        progress: impl Fn(ProgressEvent) + Send + Sync,
    ) -> SearchOutcome {
        let _running = RunningGuard::enter(&self.running);
        let token = self.begin();
        let gated = |event: ProgressEvent| {
            if !token.is_cancelled() {
                progress(event);
            }
        };

        let result = find_collaborations(&self.tmdb, name1, name2, today, &token, &gated).await;
        if token.is_cancelled() {
            tracing::debug!(name1, name2, "search superseded");
            return SearchOutcome::Superseded;
        }

        match result {
            Ok(report) => SearchOutcome::Completed(report),
            Err(CoreError::NotFound { name }) => SearchOutcome::NotFound { name },
            Err(CoreError::Cancelled) => SearchOutcome::Superseded,
            Err(e) => {
                tracing::warn!(name1, name2, error = %e, "search failed");
                SearchOutcome::Failed(e)
            }
        }
    }
}
