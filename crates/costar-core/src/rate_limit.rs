//! Rate-limit handling for upstream API calls.
//!
//! Two mechanisms work together:
//! - A reactive retry policy: a 429 response is retried exactly once, after
//!   the server's `Retry-After` advice clamped to [`MAX_RATE_LIMIT_WAIT`].
//! - An optional proactive [`RequestPacer`] that spaces requests with a
//!   governor and slows down after each 429.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::time::Instant;

/// Wait used when a 429 carries no usable `Retry-After` header.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Upper bound on any rate-limit wait, whatever the server advises.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(3);

/// Strongest slowdown the pacer applies (1/8 of the configured rate).
const MAX_SLOWDOWN: u32 = 8;

/// Quiet time after which the pacer steps its slowdown back down.
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

type Governor = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.signed_duration_since(chrono::Utc::now());
    // A date in the past means "retry now".
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Extract the advisory wait from a response's headers.
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?;
    parse_retry_after(raw.to_str().ok()?)
}

/// How long to wait before retrying a rate-limited request.
pub fn backoff_for(retry_after: Option<Duration>) -> Duration {
    retry_after
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
        .min(MAX_RATE_LIMIT_WAIT)
}

struct PacerState {
    slowdown: u32,
    last_throttled: Option<Instant>,
}

/// Proactive request spacing shared by every request of a client.
///
/// Each 429 doubles the spacing (up to [`MAX_SLOWDOWN`]). Every
/// [`RECOVERY_WINDOW`] without a 429 halves it again, one step at a time,
/// until the configured rate is back.
pub struct RequestPacer {
    base_period: Duration,
    governor: ArcSwap<Governor>,
    state: Mutex<PacerState>,
}

impl RequestPacer {
    /// One request per `period`. Periods under a millisecond are rounded up.
    pub fn with_period(period: Duration) -> Self {
        let base_period = period.max(Duration::from_millis(1));
        Self {
            base_period,
            governor: ArcSwap::from_pointee(Self::governor(base_period, 1)),
            state: Mutex::new(PacerState {
                slowdown: 1,
                last_throttled: None,
            }),
        }
    }

    pub fn per_second(n: u32) -> Self {
        Self::with_period(Duration::from_secs(1) / n.max(1))
    }

    fn governor(base_period: Duration, slowdown: u32) -> Governor {
        let period = base_period.saturating_mul(slowdown);
        let quota =
            Quota::with_period(period).unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));
        RateLimiter::direct(quota)
    }

    /// Wait for the next request slot.
    pub async fn acquire(&self) {
        self.recover();
        let governor = self.governor.load_full();
        governor.until_ready().await;
    }

    /// Record a 429 and slow down.
    pub fn on_rate_limited(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.last_throttled = Some(Instant::now());
        let slowdown = (state.slowdown * 2).min(MAX_SLOWDOWN);
        if slowdown != state.slowdown {
            state.slowdown = slowdown;
            self.governor
                .store(Arc::new(Self::governor(self.base_period, slowdown)));
            tracing::info!(slowdown, "rate limited, pacing requests more slowly");
        }
    }

    /// Step the slowdown down once per quiet window that has passed.
    fn recover(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(since) = state.last_throttled else {
            return;
        };
        if state.slowdown == 1 || since.elapsed() < RECOVERY_WINDOW {
            return;
        }
        state.slowdown /= 2;
        state.last_throttled = (state.slowdown > 1).then(Instant::now);
        self.governor
            .store(Arc::new(Self::governor(self.base_period, state.slowdown)));
        tracing::debug!(slowdown = state.slowdown, "pacing recovered one step");
    }

    /// Current slowdown factor (1 = configured rate).
    pub fn slowdown(&self) -> u32 {
        self.state.lock().map(|s| s.slowdown).unwrap_or(1)
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("base_period", &self.base_period)
            .field("slowdown", &self.slowdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn retry_after_past_http_date_means_now() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_future_http_date() {
        let at = chrono::Utc::now() + chrono::Duration::seconds(120);
        let wait = parse_retry_after(&at.to_rfc2822()).unwrap();
        assert!(wait > Duration::from_secs(100) && wait <= Duration::from_secs(120));
    }

    #[test]
    fn retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn backoff_clamps_and_defaults() {
        assert_eq!(backoff_for(None), Duration::from_secs(1));
        assert_eq!(
            backoff_for(Some(Duration::from_secs(10))),
            Duration::from_secs(3)
        );
        assert_eq!(
            backoff_for(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(backoff_for(Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn header_extraction() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after_header(&headers), None);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("7"),
        );
        assert_eq!(retry_after_header(&headers), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn throttling_doubles_up_to_the_cap() {
        let pacer = RequestPacer::per_second(20);
        assert_eq!(pacer.slowdown(), 1);
        pacer.on_rate_limited();
        assert_eq!(pacer.slowdown(), 2);
        for _ in 0..5 {
            pacer.on_rate_limited();
        }
        assert_eq!(pacer.slowdown(), MAX_SLOWDOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_one_step_per_quiet_window() {
        let pacer = RequestPacer::per_second(20);
        pacer.on_rate_limited();
        pacer.on_rate_limited();
        assert_eq!(pacer.slowdown(), 4);

        tokio::time::advance(Duration::from_secs(30)).await;
        pacer.acquire().await;
        assert_eq!(pacer.slowdown(), 4);

        tokio::time::advance(Duration::from_secs(31)).await;
        pacer.acquire().await;
        assert_eq!(pacer.slowdown(), 2);

        tokio::time::advance(RECOVERY_WINDOW).await;
        pacer.acquire().await;
        assert_eq!(pacer.slowdown(), 1);
    }
}
