//! Worker lifecycle: registration slots, install-time precache, activation
//! cleanup and page control messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cafe_net::{Fetcher, Request, Response};
use futures::future::try_join_all;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheEntry, SharedCaches};
use crate::config::CacheConfig;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Purging stale buckets.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, unregistered, or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// One deployed generation of the cache layer.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    /// Generation this worker serves.
    pub config: Arc<CacheConfig>,

    pub state: ServiceWorkerState,

    /// Skip the waiting phase once installed.
    pub skip_waiting: bool,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(config: Arc<CacheConfig>) -> Self {
        let skip_waiting = config.skip_waiting_on_install;
        Self {
            id: ServiceWorkerId::new(),
            config,
            state: ServiceWorkerState::Parsed,
            skip_waiting,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn generation(&self) -> &str {
        &self.config.generation
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// Installing/waiting/active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Start installing a new generation. A previous installing worker is
    /// returned as redundant.
    pub fn update(&mut self, config: Arc<CacheConfig>) -> (ServiceWorkerId, Option<ServiceWorker>) {
        let mut worker = ServiceWorker::new(config);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        let replaced = self.installing.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        (id, replaced)
    }

    /// Transition installing to waiting. A previous waiting worker becomes
    /// redundant and is returned.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self
            .installing
            .take_if(|w| w.id == id)
            .ok_or_else(|| ServiceWorkerError::StateError(format!("worker {} is not installing", id.raw())))?;
        worker.set_state(ServiceWorkerState::Installed);
        let replaced = self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok(replaced)
    }

    /// Drop a worker whose install failed.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        self.installing.take_if(|w| w.id == id).map(|mut worker| {
            worker.set_state(ServiceWorkerState::Redundant);
            worker
        })
    }

    /// Promote the waiting worker to active in the `Activating` state.
    /// Returns the new worker and the one it replaced.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let old = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        self.active = Some(worker.clone());
        Some((worker, old))
    }

    /// Finish activation of the active worker.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut() {
            Some(worker) if worker.id == id && worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// Find a worker in any slot.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
            .map(|mut worker| {
                worker.set_state(ServiceWorkerState::Redundant);
                worker
            })
            .collect()
    }
}

// ==================== Install / Activate ====================

/// Fetch every manifest URL and store them in the precache bucket.
///
/// All-or-nothing: any transport failure or non-200 status aborts before
/// anything is written, and a failed write removes the bucket again.
pub async fn precache(
    fetcher: &dyn Fetcher,
    caches: &SharedCaches,
    config: &CacheConfig,
    scope: &Url,
) -> Result<usize, ServiceWorkerError> {
    let urls = config.precache_urls(scope)?;
    let bucket = config.precache_bucket();

    let responses: Vec<(Url, Response)> = try_join_all(urls.into_iter().map(|url| async move {
        let response = fetcher
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if response.status != StatusCode::OK {
            return Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }
        Ok::<_, ServiceWorkerError>((url, response))
    }))
    .await?;

    let mut storage = caches.write().await;
    let existed = storage.has(&bucket);
    for (url, response) in &responses {
        let entry = CacheEntry::from_response(url.clone(), response);
        if let Err(err) = storage.put(&bucket, url.as_str(), entry) {
            if !existed {
                storage.delete(&bucket);
            }
            return Err(err);
        }
        debug!(url = %url, %bucket, "Precached");
    }

    info!(%bucket, count = responses.len(), "Precache complete");
    Ok(responses.len())
}

/// Delete every bucket that does not belong to `config`'s generation.
pub async fn purge_stale_buckets(caches: &SharedCaches, config: &CacheConfig) -> Vec<String> {
    let mut storage = caches.write().await;
    let stale: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|name| !config.is_current_bucket(name))
        .map(str::to_string)
        .collect();

    for name in &stale {
        storage.delete(name);
        info!(bucket = %name, "Deleted stale cache bucket");
    }
    stale
}

// ==================== Messages ====================

/// Control messages a page may post to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate a waiting worker now.
    SkipWaiting,
}

impl ClientMessage {
    /// Parse a posted message. Unknown message types yield `None`.
    pub fn parse(json: &str) -> Result<Option<Self>, ServiceWorkerError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))?;
        match serde_json::from_value(value) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                debug!(error = %e, "Ignoring unknown message");
                Ok(None)
            }
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            Self::SkipWaiting => r#"{"type":"SKIP_WAITING"}"#.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use cafe_net::MemoryFetcher;

    fn scope() -> Url {
        Url::parse("https://cafe.example/").unwrap()
    }

    fn registration_with_active(generation: &str) -> ServiceWorkerRegistration {
        let mut registration = ServiceWorkerRegistration::new(scope());
        let (id, _) = registration.update(Arc::new(CacheConfig::with_generation(generation)));
        registration.install_complete(id).unwrap();
        let (worker, _) = registration.begin_activation().unwrap();
        registration.finish_activation(worker.id);
        registration
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        assert!(registration.active.is_none());

        let (id, replaced) = registration.update(Arc::new(CacheConfig::default()));
        assert!(replaced.is_none());
        assert_eq!(registration.installing.as_ref().unwrap().state, ServiceWorkerState::Installing);

        registration.install_complete(id).unwrap();
        assert!(registration.installing.is_none());
        assert_eq!(registration.waiting.as_ref().unwrap().state, ServiceWorkerState::Installed);

        let (worker, old) = registration.begin_activation().unwrap();
        assert!(old.is_none());
        assert_eq!(worker.state, ServiceWorkerState::Activating);
        assert!(registration.finish_activation(id));
        assert!(registration.active.as_ref().unwrap().is_active());
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_activation_replaces_old_active() {
        let mut registration = registration_with_active("v4");
        let (id, _) = registration.update(Arc::new(CacheConfig::with_generation("v5")));
        registration.install_complete(id).unwrap();

        let (worker, old) = registration.begin_activation().unwrap();
        assert_eq!(worker.generation(), "v5");
        let old = old.unwrap();
        assert!(old.is_redundant());
        assert_eq!(old.generation(), "v4");
    }

    #[test]
    fn test_install_complete_rejects_unknown_worker() {
        let mut registration = registration_with_active("v4");
        let active_id = registration.active.as_ref().unwrap().id;
        assert!(matches!(
            registration.install_complete(active_id),
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[test]
    fn test_install_failed_marks_redundant() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        let (id, _) = registration.update(Arc::new(CacheConfig::default()));
        let failed = registration.install_failed(id).unwrap();
        assert!(failed.is_redundant());
        assert!(registration.worker(id).is_none());
    }

    #[test]
    fn test_unregister() {
        let mut registration = registration_with_active("v5");
        let dropped = registration.unregister();
        assert_eq!(dropped.len(), 1);
        assert!(dropped.iter().all(ServiceWorker::is_redundant));
        assert!(registration.active.is_none());
    }

    #[tokio::test]
    async fn test_precache_stores_manifest() {
        let origin = MemoryFetcher::new();
        origin.route_json("https://cafe.example/menu.json", "[]");
        origin.route_json("https://cafe.example/manifest.json", "{}");
        let caches = CacheStorage::new().shared();

        let count = precache(&origin, &caches, &CacheConfig::default(), &scope()).await.unwrap();
        assert_eq!(count, 2);

        let storage = caches.read().await;
        let bucket = storage.get("cafe-app-shell-v5").unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(bucket.match_request("https://cafe.example/manifest.json").is_some());
    }

    #[tokio::test]
    async fn test_precache_is_all_or_nothing() {
        let origin = MemoryFetcher::new();
        origin.route_json("https://cafe.example/menu.json", "[]");
        // manifest.json is not routed: 404
        let caches = CacheStorage::new().shared();

        let err = precache(&origin, &caches, &CacheConfig::default(), &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));
        assert!(!caches.read().await.has("cafe-app-shell-v5"));
    }

    #[tokio::test]
    async fn test_precache_offline_fails() {
        let origin = MemoryFetcher::new();
        origin.set_offline(true);
        let caches = CacheStorage::new().shared();

        let err = precache(&origin, &caches, &CacheConfig::default(), &scope())
            .await
            .unwrap_err();
        match err {
            ServiceWorkerError::InstallFailed { reason, .. } => {
                assert!(reason.contains("unreachable"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_purge_keeps_only_current_generation() {
        let caches = CacheStorage::new().shared();
        {
            let mut storage = caches.write().await;
            for name in ["cafe-app-shell-v4", "cafe-runtime-v4", "cafe-app-shell-v5", "cafe-runtime-v5", "other"] {
                storage.open(name);
            }
        }

        let mut deleted = purge_stale_buckets(&caches, &CacheConfig::default()).await;
        deleted.sort();
        assert_eq!(deleted, vec!["cafe-app-shell-v4", "cafe-runtime-v4", "other"]);
        assert_eq!(caches.read().await.keys(), vec!["cafe-app-shell-v5", "cafe-runtime-v5"]);
    }

    #[test]
    fn test_message_parsing() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
            Some(ClientMessage::SkipWaiting)
        );
        assert_eq!(ClientMessage::parse(r#"{"type":"PING"}"#).unwrap(), None);
        assert_eq!(ClientMessage::parse(r#"{"kind":"x"}"#).unwrap(), None);
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ServiceWorkerError::InvalidMessage(_))
        ));
        assert_eq!(
            ClientMessage::parse(&ClientMessage::SkipWaiting.to_json()).unwrap(),
            Some(ClientMessage::SkipWaiting)
        );
    }
}
