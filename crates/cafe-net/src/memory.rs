//! In-memory origin for offline runs and tests.
//!
//! [`MemoryFetcher`] serves routes registered ahead of time, can be switched
//! offline, counts calls per URL, and can hold a URL's response until a
//! [`FetchGate`] is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use tokio::sync::Notify;
use tracing::trace;

use crate::{cache_key, Fetcher, NetError, Request, Response, Url};

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: Bytes,
}

/// Releases a held response.
#[derive(Debug, Clone)]
pub struct FetchGate {
    notify: Arc<Notify>,
}

impl FetchGate {
    /// Let the held fetch complete.
    pub fn release(&self) {
        self.notify.notify_one();
    }
}

/// A [`Fetcher`] that answers from a route table.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: Mutex<HashMap<String, Route>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryFetcher {
    /// Create an empty origin. Unknown URLs answer 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with `status` for `url`.
    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.insert(url, status, None, body.into())
    }

    /// Serve a JSON document with status 200.
    pub fn route_json(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.insert(url, 200, Some("application/json"), body.into())
    }

    /// Serve an HTML document with status 200.
    pub fn route_html(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.insert(url, 200, Some("text/html"), body.into())
    }

    fn insert(&self, url: &str, status: u16, content_type: Option<&'static str>, body: Bytes) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        lock(&self.routes).insert(
            normalize(url),
            Route {
                status,
                content_type,
                body,
            },
        );
        self
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold responses for `url` until the returned gate is released.
    pub fn hold(&self, url: &str) -> FetchGate {
        let notify = Arc::new(Notify::new());
        lock(&self.gates).insert(normalize(url), Arc::clone(&notify));
        FetchGate { notify }
    }

    /// Number of fetches issued for `url`.
    pub fn calls_for(&self, url: &str) -> usize {
        let key = normalize(url);
        lock(&self.calls).iter().filter(|c| **c == key).count()
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    async fn respond(&self, request: Request) -> Result<Response, NetError> {
        let key = request.cache_key();
        lock(&self.calls).push(key.clone());

        let gate = lock(&self.gates).remove(&key);
        if let Some(notify) = gate {
            trace!(url = %key, "Holding response");
            notify.notified().await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(key));
        }

        let route = lock(&self.routes).get(&key).cloned();
        let response = match route {
            Some(route) => {
                let mut response = Response::new(request.url, route.status, route.body);
                if let Some(content_type) = route.content_type {
                    response = response.with_header(CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                response
            }
            None => Response::new(request.url, StatusCode::NOT_FOUND, Bytes::new()),
        };
        Ok(response)
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| cache_key(&u))
        .unwrap_or_else(|_| url.to_string())
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.respond(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_routes_and_unknown_urls() {
        let origin = MemoryFetcher::new();
        origin.route_json("https://cafe.example/menu.json", "[]");

        let hit = origin.fetch(get("https://cafe.example/menu.json")).await.unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.header("content-type"), Some("application/json"));

        let miss = origin.fetch(get("https://cafe.example/nope")).await.unwrap();
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
        assert_eq!(origin.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_rejects_and_counts() {
        let origin = MemoryFetcher::new();
        origin.route("https://cafe.example/app.js", 200, "console.log(1)");
        origin.set_offline(true);

        let result = origin.fetch(get("https://cafe.example/app.js")).await;
        assert!(matches!(result, Err(NetError::Offline(_))));
        assert_eq!(origin.calls_for("https://cafe.example/app.js"), 1);
    }

    #[tokio::test]
    async fn test_hold_until_released() {
        let origin = Arc::new(MemoryFetcher::new());
        origin.route("https://cafe.example/menu.json", 200, "v2");
        let gate = origin.hold("https://cafe.example/menu.json");

        let task = {
            let origin = Arc::clone(&origin);
            tokio::spawn(async move { origin.fetch(get("https://cafe.example/menu.json")).await })
        };
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        gate.release();
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.text().unwrap(), "v2");
    }
}
