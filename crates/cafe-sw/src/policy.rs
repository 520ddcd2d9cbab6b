//! Caching policies, one per [`RequestCategory`].
//!
//! | Category | Read order | Fallback when the network fails |
//! |---|---|---|
//! | Precache, Default | any bucket, then network | none |
//! | CoreAsset | network only | any bucket |
//! | Image | runtime bucket, then network | none |
//! | DataDocument | cached copy now, network in background | none when uncached |
//! | Navigation | network | root document |
//!
//! Every network result goes through [`PolicyExecutor::store`], which only
//! writes same-origin 200 responses and never fails the request.

use std::sync::Arc;

use cafe_net::{Fetcher, NetError, Request, Response};
use http::StatusCode;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, SharedCaches};
use crate::config::CacheConfig;
use crate::router::{RequestCategory, RequestRouter};
use crate::ServiceWorkerError;

/// A background refresh started by stale-while-revalidate.
pub type Revalidation = JoinHandle<Result<Response, NetError>>;

/// What a policy hands back to the page.
#[derive(Debug)]
pub struct PolicyOutcome {
    pub response: Response,
    /// Refresh still running after the response was returned.
    pub revalidation: Option<Revalidation>,
}

impl PolicyOutcome {
    fn ready(response: Response) -> Self {
        Self {
            response,
            revalidation: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    AnyBucket,
    Runtime,
}

/// Runs policies for one generation.
#[derive(Clone)]
pub struct PolicyExecutor {
    caches: SharedCaches,
    fetcher: Arc<dyn Fetcher>,
    config: Arc<CacheConfig>,
    router: RequestRouter,
}

impl PolicyExecutor {
    pub fn new(
        caches: SharedCaches,
        fetcher: Arc<dyn Fetcher>,
        config: Arc<CacheConfig>,
        router: RequestRouter,
    ) -> Self {
        Self {
            caches,
            fetcher,
            config,
            router,
        }
    }

    /// Handle `request` with the policy for `category`.
    pub async fn execute(
        &self,
        category: RequestCategory,
        request: Request,
    ) -> Result<PolicyOutcome, ServiceWorkerError> {
        debug!(url = %request.url, %category, "Applying cache policy");
        match category {
            RequestCategory::Precache | RequestCategory::Default => self
                .cache_first(request, Lookup::AnyBucket)
                .await
                .map(PolicyOutcome::ready),
            RequestCategory::Image => self
                .cache_first(request, Lookup::Runtime)
                .await
                .map(PolicyOutcome::ready),
            RequestCategory::CoreAsset => self.network_first(request).await.map(PolicyOutcome::ready),
            RequestCategory::DataDocument => self.stale_while_revalidate(request).await,
            RequestCategory::Navigation => self.navigate(request).await.map(PolicyOutcome::ready),
        }
    }

    async fn cache_first(&self, request: Request, lookup: Lookup) -> Result<Response, ServiceWorkerError> {
        let key_url = key_url(&request.url);
        if let Some(hit) = self.lookup(lookup, &key_url).await {
            return Ok(hit);
        }

        let response = self.fetcher.fetch(request).await?;
        self.store(&key_url, &response).await;
        Ok(response)
    }

    async fn network_first(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let key_url = key_url(&request.url);
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(&key_url, &response).await;
                Ok(response)
            }
            Err(err) => {
                debug!(url = %key_url, error = %err, "Network failed, trying cache");
                self.lookup(Lookup::AnyBucket, &key_url)
                    .await
                    .ok_or(ServiceWorkerError::Network(err))
            }
        }
    }

    async fn stale_while_revalidate(&self, request: Request) -> Result<PolicyOutcome, ServiceWorkerError> {
        let key_url = key_url(&request.url);
        let cached = match self.lookup(Lookup::Runtime, &key_url).await {
            Some(hit) => Some(hit),
            None => self.lookup_precache(&key_url).await,
        };

        let revalidation = {
            let this = self.clone();
            tokio::spawn(async move { this.revalidate(request, key_url).await })
        };

        match cached {
            Some(response) => Ok(PolicyOutcome {
                response,
                revalidation: Some(revalidation),
            }),
            None => {
                let response = revalidation
                    .await
                    .map_err(|e| ServiceWorkerError::TaskFailed(e.to_string()))??;
                Ok(PolicyOutcome::ready(response))
            }
        }
    }

    async fn revalidate(&self, request: Request, key_url: Url) -> Result<Response, NetError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(&key_url, &response).await;
                Ok(response)
            }
            Err(err) => {
                debug!(url = %key_url, error = %err, "Revalidation failed");
                Err(err)
            }
        }
    }

    async fn navigate(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let root = self.config.root_document_url(self.router.scope())?;
        let request_url = request.url.clone();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if self.router.is_cacheable_url(&request_url) {
                    self.store(&root, &response).await;
                }
                Ok(response)
            }
            Err(err) => {
                debug!(url = %request_url, error = %err, "Navigation offline, serving root document");
                self.lookup(Lookup::AnyBucket, &root)
                    .await
                    .ok_or(ServiceWorkerError::Network(err))
            }
        }
    }

    async fn lookup(&self, lookup: Lookup, key_url: &Url) -> Option<Response> {
        let caches = self.caches.read().await;
        let entry = match lookup {
            Lookup::AnyBucket => caches.match_request(key_url.as_str()),
            Lookup::Runtime => caches.match_in(&self.config.runtime_bucket(), key_url.as_str()),
        };
        entry.map(CacheEntry::to_response)
    }

    async fn lookup_precache(&self, key_url: &Url) -> Option<Response> {
        let caches = self.caches.read().await;
        caches
            .match_in(&self.config.precache_bucket(), key_url.as_str())
            .map(CacheEntry::to_response)
    }

    /// Write `response` to the runtime bucket under `key_url` if it is a
    /// same-origin 200. Storage failures are logged and dropped.
    pub async fn store(&self, key_url: &Url, response: &Response) -> bool {
        if response.status != StatusCode::OK {
            debug!(url = %key_url, status = %response.status, "Not caching non-200 response");
            return false;
        }
        if !self.router.is_cacheable_url(key_url) || !self.router.is_cacheable_url(&response.url) {
            debug!(url = %key_url, "Not caching cross-origin response");
            return false;
        }

        let entry = CacheEntry::from_response(key_url.clone(), response);
        let bucket = self.config.runtime_bucket();
        let result = self.caches.write().await.put(&bucket, key_url.as_str(), entry);
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(url = %key_url, %bucket, error = %err, "Cache write failed");
                false
            }
        }
    }
}

fn key_url(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}
