//! The offline cache manager: owns the registration, clients and cache
//! storage, and dispatches intercepted fetches to the active generation.

use std::sync::Arc;

use cafe_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SharedCaches;
use crate::clients::Clients;
use crate::config::CacheConfig;
use crate::lifecycle::{
    self, ClientMessage, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState,
};
use crate::policy::{PolicyExecutor, Revalidation};
use crate::router::RequestRouter;
use crate::ServiceWorkerError;

/// Events reported to pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A new generation started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        generation: String,
        new_state: ServiceWorkerState,
    },
    /// A page is now served by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A stale bucket was purged during activation.
    BucketDeleted { name: String },
}

/// Request-intercepting cache layer for one scope.
pub struct OfflineCacheManager {
    scope: Url,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    caches: SharedCaches,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetcher>,
    background: Mutex<Vec<Revalidation>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineCacheManager {
    /// Create a manager for `scope`. A scope without a trailing slash is
    /// cut back to its directory.
    pub fn new(
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
        caches: SharedCaches,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), ServiceWorkerError> {
        if !matches!(scope.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope must be http(s): {scope}"
            )));
        }
        let scope = directory_of(scope);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(scope = %scope, "Offline cache registered");

        Ok((
            Self {
                registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope.clone()))),
                scope,
                caches,
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                background: Mutex::new(Vec::new()),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn caches(&self) -> SharedCaches {
        Arc::clone(&self.caches)
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(WorkerEvent::StateChange {
            worker_id: worker.id,
            generation: worker.generation().to_string(),
            new_state: worker.state,
        });
    }

    // ==================== Lifecycle ====================

    /// Install a new generation.
    ///
    /// On failure the worker becomes redundant and the previously active
    /// generation keeps serving. On success the worker either activates
    /// right away or waits (see [`OfflineCacheManager::post_message`]).
    pub async fn install(&self, config: CacheConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        config.validate()?;
        let config = Arc::new(config);

        let worker_id = {
            let mut registration = self.registration.write().await;
            let (id, replaced) = registration.update(Arc::clone(&config));
            if let Some(old) = replaced {
                self.emit_state(&old);
            }
            self.emit(WorkerEvent::UpdateFound { worker_id: id });
            if let Some(worker) = registration.worker(id) {
                self.emit_state(worker);
            }
            id
        };

        info!(generation = %config.generation, "Installing");

        if let Err(err) = lifecycle::precache(self.fetcher.as_ref(), &self.caches, &config, &self.scope).await {
            warn!(generation = %config.generation, error = %err, "Install failed");
            if let Some(worker) = self.registration.write().await.install_failed(worker_id) {
                self.emit_state(&worker);
            }
            return Err(err);
        }

        let activate_now = {
            let mut registration = self.registration.write().await;
            let skip_waiting = registration
                .installing
                .as_ref()
                .is_some_and(|w| w.id == worker_id && w.skip_waiting);
            if let Some(old) = registration.install_complete(worker_id)? {
                self.emit_state(&old);
            }
            if let Some(worker) = registration.worker(worker_id) {
                self.emit_state(worker);
            }

            let old_clients = match registration.active.as_ref() {
                Some(active) => self.clients.read().await.controlled_by(active.id),
                None => 0,
            };
            skip_waiting || old_clients == 0
        };

        if activate_now {
            self.activate_waiting().await?;
        } else {
            info!(generation = %config.generation, "Installed, waiting for existing pages");
        }
        Ok(worker_id)
    }

    /// Activate the waiting worker, purge stale buckets, claim clients.
    async fn activate_waiting(&self) -> Result<(), ServiceWorkerError> {
        let worker = {
            let mut registration = self.registration.write().await;
            let Some((worker, old)) = registration.begin_activation() else {
                return Err(ServiceWorkerError::StateError("no waiting worker".into()));
            };
            if let Some(old) = old {
                self.emit_state(&old);
            }
            self.emit_state(&worker);
            worker
        };

        for name in lifecycle::purge_stale_buckets(&self.caches, &worker.config).await {
            self.emit(WorkerEvent::BucketDeleted { name });
        }

        {
            let mut registration = self.registration.write().await;
            if !registration.finish_activation(worker.id) {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} replaced during activation",
                    worker.id.raw()
                )));
            }
            if let Some(active) = registration.active.as_ref() {
                self.emit_state(active);
            }
        }

        let claimed = self.clients.write().await.claim(&self.scope, worker.id);
        for client_id in claimed {
            self.emit(WorkerEvent::ControllerChange {
                client_id,
                worker_id: worker.id,
            });
        }

        info!(generation = %worker.generation(), "Activated");
        Ok(())
    }

    /// Deliver a page message to `worker_id`.
    ///
    /// `SKIP_WAITING` activates a waiting worker immediately, or marks an
    /// installing one to skip waiting once installed.
    pub async fn post_message(&self, worker_id: ServiceWorkerId, json: &str) -> Result<(), ServiceWorkerError> {
        let Some(message) = ClientMessage::parse(json)? else {
            return Ok(());
        };

        match message {
            ClientMessage::SkipWaiting => {
                let is_waiting = {
                    let mut registration = self.registration.write().await;
                    if registration.waiting.as_ref().is_some_and(|w| w.id == worker_id) {
                        true
                    } else if let Some(worker) =
                        registration.installing.as_mut().filter(|w| w.id == worker_id)
                    {
                        worker.skip_waiting = true;
                        false
                    } else if registration.worker(worker_id).is_some() {
                        debug!(worker = worker_id.raw(), "Skip waiting on active worker ignored");
                        false
                    } else {
                        return Err(ServiceWorkerError::NotFound(format!("worker {}", worker_id.raw())));
                    }
                };
                if is_waiting {
                    info!(worker = worker_id.raw(), "Skip waiting requested");
                    self.activate_waiting().await?;
                }
            }
        }
        Ok(())
    }

    /// Remove all workers. Requests pass straight to the network afterwards.
    pub async fn unregister(&self) -> bool {
        let workers = self.registration.write().await.unregister();
        for worker in &workers {
            self.emit_state(worker);
        }
        self.clients.write().await.release_all();
        !workers.is_empty()
    }

    pub async fn active_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active.clone()
    }

    pub async fn waiting_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn installing_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.installing.clone()
    }

    // ==================== Clients ====================

    /// A page opened. It is controlled by the active worker if inside scope.
    pub async fn connect_client(&self, url: Url) -> String {
        let controller = if url.as_str().starts_with(self.scope.as_str()) {
            self.registration.read().await.active.as_ref().map(|w| w.id)
        } else {
            None
        };
        self.clients.write().await.open(url, controller).id
    }

    /// A page closed. When the last page of the old generation closes, a
    /// waiting worker activates.
    pub async fn disconnect_client(&self, client_id: &str) -> Result<(), ServiceWorkerError> {
        self.clients.write().await.remove(client_id);

        let ready = {
            let registration = self.registration.read().await;
            match (&registration.waiting, &registration.active) {
                (Some(_), Some(active)) => self.clients.read().await.controlled_by(active.id) == 0,
                (Some(_), None) => true,
                _ => false,
            }
        };
        if ready {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    pub async fn controller_of(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client_id).and_then(|c| c.controller)
    }

    // ==================== Fetch ====================

    /// Intercept a page request.
    ///
    /// `Ok(None)` means the request is not intercepted and the page should
    /// go to the network itself (non-GET, or no active worker).
    pub async fn handle_fetch(&self, request: Request) -> Result<Option<Response>, ServiceWorkerError> {
        let Some(config) = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(&w.config))
        else {
            return Ok(None);
        };

        let router = RequestRouter::new(Arc::clone(&config), self.scope.clone());
        let Some(category) = router.route(&request) else {
            return Ok(None);
        };

        let executor = PolicyExecutor::new(
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
            config,
            router,
        );
        let outcome = executor.execute(category, request).await?;
        if let Some(task) = outcome.revalidation {
            let mut background = self.background.lock().await;
            background.retain(|task| !task.is_finished());
            background.push(task);
        }
        Ok(Some(outcome.response))
    }

    /// Background refreshes still running. Finished ones are dropped.
    pub async fn pending_background(&self) -> usize {
        let mut background = self.background.lock().await;
        background.retain(|task| !task.is_finished());
        background.len()
    }

    /// Wait for every background refresh started so far. Returns how many
    /// refreshed the cache successfully.
    pub async fn wait_background(&self) -> usize {
        let tasks: Vec<Revalidation> = std::mem::take(&mut *self.background.lock().await);
        let mut refreshed = 0;
        for task in tasks {
            match task.await {
                Ok(Ok(_)) => refreshed += 1,
                Ok(Err(err)) => debug!(error = %err, "Background refresh failed"),
                Err(err) => warn!(error = %err, "Background refresh panicked"),
            }
        }
        refreshed
    }
}

fn directory_of(mut scope: Url) -> Url {
    if !scope.path().ends_with('/') {
        let dir = scope
            .path()
            .rsplit_once('/')
            .map(|(dir, _)| format!("{dir}/"))
            .unwrap_or_else(|| "/".to_string());
        scope.set_path(&dir);
    }
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use cafe_net::MemoryFetcher;

    fn origin() -> Arc<MemoryFetcher> {
        let origin = Arc::new(MemoryFetcher::new());
        origin.route_json("https://cafe.example/menu.json", "[]");
        origin.route_json("https://cafe.example/manifest.json", "{}");
        origin
    }

    fn manager(
        origin: &Arc<MemoryFetcher>,
    ) -> (OfflineCacheManager, mpsc::UnboundedReceiver<WorkerEvent>) {
        OfflineCacheManager::new(
            Url::parse("https://cafe.example/").unwrap(),
            Arc::clone(origin) as Arc<dyn Fetcher>,
            CacheStorage::new().shared(),
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_scope_is_cut_to_directory() {
        let scope = directory_of(Url::parse("https://cafe.example/app/service-worker.js?v=2").unwrap());
        assert_eq!(scope.as_str(), "https://cafe.example/app/");
    }

    #[test]
    fn test_rejects_non_http_scope() {
        let result = OfflineCacheManager::new(
            Url::parse("file:///srv/cafe/").unwrap(),
            Arc::new(MemoryFetcher::new()),
            CacheStorage::new().shared(),
        );
        assert!(matches!(result, Err(ServiceWorkerError::RegistrationFailed(_))));
    }

    #[tokio::test]
    async fn test_first_install_activates() {
        let origin = origin();
        let (manager, mut rx) = manager(&origin);

        let id = manager.install(CacheConfig::default()).await.unwrap();
        let active = manager.active_worker().await.unwrap();
        assert_eq!(active.id, id);
        assert!(active.is_active());

        let states: Vec<ServiceWorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::StateChange { new_state, .. } => Some(new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_active_worker_means_passthrough() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        let request = Request::get(Url::parse("https://cafe.example/menu.json").unwrap());
        assert!(manager.handle_fetch(request).await.unwrap().is_none());
        assert_eq!(origin.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_generation() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        manager.install(CacheConfig::with_generation("v4")).await.unwrap();

        origin.set_offline(true);
        let err = manager.install(CacheConfig::with_generation("v5")).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));

        let active = manager.active_worker().await.unwrap();
        assert_eq!(active.generation(), "v4");
        assert!(manager.installing_worker().await.is_none());
        assert!(manager.caches().read().await.has("cafe-app-shell-v4"));
    }

    #[tokio::test]
    async fn test_waiting_worker_activates_when_old_pages_close() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        manager.install(CacheConfig::with_generation("v4")).await.unwrap();
        let page = manager.connect_client(Url::parse("https://cafe.example/").unwrap()).await;

        let config = CacheConfig {
            skip_waiting_on_install: false,
            ..CacheConfig::with_generation("v5")
        };
        let id = manager.install(config).await.unwrap();
        assert_eq!(manager.waiting_worker().await.unwrap().id, id);
        assert_eq!(manager.active_worker().await.unwrap().generation(), "v4");

        manager.disconnect_client(&page).await.unwrap();
        assert_eq!(manager.active_worker().await.unwrap().id, id);
        assert!(manager.waiting_worker().await.is_none());
    }

    #[tokio::test]
    async fn test_post_message_to_unknown_worker() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        let id = manager.install(CacheConfig::default()).await.unwrap();
        manager.unregister().await;

        let result = manager.post_message(id, r#"{"type":"SKIP_WAITING"}"#).await;
        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
        // Unknown types are ignored before any lookup.
        manager.post_message(id, r#"{"type":"PING"}"#).await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_refreshes_are_released() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        manager.install(CacheConfig::default()).await.unwrap();

        let menu = Url::parse("https://cafe.example/menu.json").unwrap();
        for _ in 0..200 {
            let response = manager.handle_fetch(Request::get(menu.clone())).await.unwrap();
            assert!(response.unwrap().from_cache);
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(manager.background.lock().await.len() < 10);
        assert_eq!(manager.pending_background().await, 0);
        assert_eq!(manager.wait_background().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_stops_interception() {
        let origin = origin();
        let (manager, _rx) = manager(&origin);
        manager.install(CacheConfig::default()).await.unwrap();
        let page = manager.connect_client(Url::parse("https://cafe.example/").unwrap()).await;
        assert!(manager.controller_of(&page).await.is_some());

        assert!(manager.unregister().await);
        assert!(manager.controller_of(&page).await.is_none());
        let request = Request::get(Url::parse("https://cafe.example/app.js").unwrap());
        assert!(manager.handle_fetch(request).await.unwrap().is_none());
    }
}
