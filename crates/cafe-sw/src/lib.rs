//! # Cafe Offline Cache
//!
//! Request-intercepting cache layer that keeps the cafe menu, kitchen board
//! and admin pages usable offline.
//!
//! ## Features
//!
//! - **Routing**: each GET request is classified into one caching policy
//! - **Policies**: cache-first, network-first, stale-while-revalidate and
//!   navigation fallback
//! - **Generations**: versioned precache/runtime buckets, stale ones purged
//!   on activation
//! - **Lifecycle**: install, waiting, activate, `SKIP_WAITING` control message
//! - **Update prompt**: page-side helper deciding when to offer a reload
//!
//! ## Architecture
//!
//! ```text
//! OfflineCacheManager
//!     ├── ServiceWorkerRegistration (scope)
//!     │       ├── installing
//!     │       ├── waiting
//!     │       └── active ── CacheConfig (generation tag)
//!     ├── Clients (controlled pages)
//!     └── CacheStorage
//!             ├── <shell-prefix>-<tag>
//!             └── <runtime-prefix>-<tag>
//!
//! page fetch → RequestRouter → PolicyExecutor → CacheStorage / Fetcher
//! ```

use cafe_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod lifecycle;
pub mod manager;
pub mod policy;
pub mod router;
pub mod update;

pub use cache::{Cache, CacheEntry, CacheStorage, SharedCaches};
pub use clients::{Client, Clients};
pub use config::CacheConfig;
pub use lifecycle::{
    ClientMessage, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use manager::{OfflineCacheManager, WorkerEvent};
pub use policy::{PolicyExecutor, PolicyOutcome};
pub use router::{RequestCategory, RequestRouter};
pub use update::{PageAction, UpdateNotifier};

/// Errors that can occur in the offline cache layer.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache quota exceeded in {bucket}: {needed} bytes needed, {available} available")]
    QuotaExceeded {
        bucket: String,
        needed: usize,
        available: usize,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
