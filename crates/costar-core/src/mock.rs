//! In-process transport for tests and offline demos.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::fetcher::{HttpResponse, Transport};

/// A configurable mock response for [`MockTransport`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// 200 with the given JSON body.
    Json(Value),
    /// 200 with a raw (possibly invalid) body.
    Body(String),
    /// An error status with an empty JSON body.
    Status(u16),
    /// Simulate a 429 rate-limit response.
    RateLimited { retry_after: Option<Duration> },
    /// Simulate a transport failure.
    Error(String),
}

#[derive(Default)]
struct Route {
    /// Reversed, so `pop()` yields the next response. The last one repeats.
    sequence: Vec<MockResponse>,
    fallback: Option<MockResponse>,
    delay: Option<Duration>,
}

/// A hand-rolled mock implementing [`Transport`], routed by exact URL.
///
/// Supports:
/// - A fixed response per URL, **or**
/// - A sequence of responses (one per call, repeating the last if exhausted).
/// - Optional latency, globally or per URL.
/// - Call counting per URL via [`call_count()`](MockTransport::call_count).
///
/// Unrouted URLs answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set simulated network latency for every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always answer `url` with `response`.
    pub fn route(&self, url: &str, response: MockResponse) {
        let mut routes = self.routes.lock().unwrap();
        let route = routes.entry(url.to_string()).or_default();
        route.sequence.clear();
        route.fallback = Some(response);
    }

    /// Answer `url` with `responses` in order, repeating the last one.
    pub fn route_sequence(&self, url: &str, mut responses: Vec<MockResponse>) {
        assert!(
            !responses.is_empty(),
            "sequence must have at least one response"
        );
        let fallback = responses.last().cloned();
        responses.reverse();
        let mut routes = self.routes.lock().unwrap();
        let route = routes.entry(url.to_string()).or_default();
        route.sequence = responses;
        route.fallback = fallback;
    }

    /// Override the latency for a single URL.
    pub fn route_delay(&self, url: &str, delay: Duration) {
        let mut routes = self.routes.lock().unwrap();
        routes.entry(url.to_string()).or_default().delay = Some(delay);
    }

    /// How many times `url` has been requested.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// How many requests have been made in total.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &str) -> (MockResponse, Option<Duration>) {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(route) => {
                let response = route
                    .sequence
                    .pop()
                    .or_else(|| route.fallback.clone())
                    .unwrap_or(MockResponse::Status(404));
                (response, route.delay.or(self.delay))
            }
            None => (MockResponse::Status(404), self.delay),
        }
    }
}

impl Transport for MockTransport {
    fn get<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, String>> + Send + 'a>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;
        let (response, delay) = self.next_response(url);

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            let ok = |body: String| HttpResponse {
                status: 200,
                retry_after: None,
                body,
            };

            match response {
                MockResponse::Json(value) => Ok(ok(value.to_string())),
                MockResponse::Body(body) => Ok(ok(body)),
                MockResponse::Status(status) => Ok(HttpResponse {
                    status,
                    retry_after: None,
                    body: "{}".to_string(),
                }),
                MockResponse::RateLimited { retry_after } => Ok(HttpResponse {
                    status: 429,
                    retry_after,
                    body: "{}".to_string(),
                }),
                MockResponse::Error(msg) => Err(msg),
            }
        })
    }
}
