//! Page-side handling of new generations: when to offer an update and when
//! to reload.

use tracing::debug;

use crate::lifecycle::{ClientMessage, ServiceWorkerId, ServiceWorkerState};
use crate::manager::{OfflineCacheManager, WorkerEvent};
use crate::ServiceWorkerError;

/// What the page should do in response to a worker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    /// Show "new version available" for this waiting worker.
    ShowUpdatePrompt(ServiceWorkerId),
    /// The controller changed; reload to pick up the new generation.
    Reload,
}

/// Tracks update state for one page.
#[derive(Debug)]
pub struct UpdateNotifier {
    client_id: String,
    has_controller: bool,
    prompted: Option<ServiceWorkerId>,
    reloading: bool,
}

impl UpdateNotifier {
    pub fn new(client_id: impl Into<String>, has_controller: bool) -> Self {
        Self {
            client_id: client_id.into(),
            has_controller,
            prompted: None,
            reloading: false,
        }
    }

    /// Build a notifier for a connected page. Returns a prompt right away
    /// if a worker is already waiting.
    pub async fn attach(manager: &OfflineCacheManager, client_id: &str) -> (Self, Option<PageAction>) {
        let has_controller = manager.controller_of(client_id).await.is_some();
        let mut notifier = Self::new(client_id, has_controller);
        let action = manager.waiting_worker().await.map(|worker| {
            notifier.prompted = Some(worker.id);
            PageAction::ShowUpdatePrompt(worker.id)
        });
        (notifier, action)
    }

    /// Feed one worker event.
    pub fn observe(&mut self, event: &WorkerEvent) -> Option<PageAction> {
        match event {
            WorkerEvent::StateChange {
                worker_id,
                new_state: ServiceWorkerState::Installed,
                ..
            } if self.has_controller => {
                self.prompted = Some(*worker_id);
                Some(PageAction::ShowUpdatePrompt(*worker_id))
            }
            WorkerEvent::ControllerChange { client_id, .. } if *client_id == self.client_id => {
                self.has_controller = true;
                if self.reloading {
                    None
                } else {
                    self.reloading = true;
                    Some(PageAction::Reload)
                }
            }
            _ => None,
        }
    }

    /// Worker the prompt was shown for, if any.
    pub fn prompted(&self) -> Option<ServiceWorkerId> {
        self.prompted
    }

    /// The user accepted the prompt: ask the waiting worker to activate.
    pub async fn accept(&self, manager: &OfflineCacheManager) -> Result<(), ServiceWorkerError> {
        let Some(worker_id) = self.prompted else {
            debug!(client = %self.client_id, "No update prompt to accept");
            return Ok(());
        };
        manager
            .post_message(worker_id, &ClientMessage::SkipWaiting.to_json())
            .await
    }
}
