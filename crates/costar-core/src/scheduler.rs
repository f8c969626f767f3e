//! Bounded-concurrency map over a list of independent async tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::task::JoinError;

/// Run `task` over every item with at most `limit` invocations active at once.
///
/// Results come back in input order regardless of completion order. Workers
/// share a cursor over the input, so a worker that finishes early claims the
/// next unclaimed item instead of idling.
///
/// If any invocation fails, the call fails with that error. Workers stop
/// claiming new items once a failure is seen, but invocations already
/// running are left to finish on their own; their results are discarded.
/// `task` receives the item and its index.
pub async fn map_limit<T, R, E, F, Fut>(items: Vec<T>, limit: usize, task: F) -> Result<Vec<R>, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: From<JoinError> + Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let len = items.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    let inputs: Arc<Vec<Mutex<Option<T>>>> =
        Arc::new(items.into_iter().map(|t| Mutex::new(Some(t))).collect());
    let outputs: Arc<Mutex<Vec<Option<R>>>> =
        Arc::new(Mutex::new((0..len).map(|_| None).collect()));
    let cursor = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let task = Arc::new(task);

    let workers = limit.max(1).min(len);
    let mut handles: FuturesUnordered<_> = (0..workers)
        .map(|_| {
            let inputs = Arc::clone(&inputs);
            let outputs = Arc::clone(&outputs);
            let cursor = Arc::clone(&cursor);
            let failed = Arc::clone(&failed);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                loop {
                    if failed.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    if index >= len {
                        return Ok(());
                    }
                    let Some(item) = inputs[index].lock().ok().and_then(|mut slot| slot.take())
                    else {
                        continue;
                    };
                    match task(item, index).await {
                        Ok(result) => {
                            if let Ok(mut out) = outputs.lock() {
                                out[index] = Some(result);
                            }
                        }
                        Err(e) => {
                            failed.store(true, Ordering::Release);
                            return Err(e);
                        }
                    }
                }
            })
        })
        .collect();

    while let Some(joined) = handles.next().await {
        // Dropping the remaining handles detaches, it does not abort.
        joined.map_err(E::from)??;
    }

    let results = match outputs.lock() {
        Ok(mut out) => std::mem::take(&mut *out),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    Ok(results.into_iter().flatten().collect())
}
