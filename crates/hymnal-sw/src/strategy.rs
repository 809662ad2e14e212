//! Response-sourcing strategies.

use std::sync::Arc;
use std::time::Duration;

use hymnal_common::with_timeout;
use hymnal_net::{Connectivity, Fetcher, NetError, Request, Response};
use tracing::{debug, trace, warn};

use crate::cache::Cache;
use crate::supervisor::CacheSupervisor;
use crate::ServiceWorkerError;

/// Fetch from the network within `deadline`. A host that reports itself
/// offline has no network.
pub(crate) async fn fetch_with_deadline(
    fetcher: &dyn Fetcher,
    connectivity: &Connectivity,
    request: &Request,
    deadline: Option<Duration>,
) -> Result<Response, NetError> {
    if !connectivity.is_online() {
        return Err(NetError::Unreachable("host is offline".to_string()));
    }
    let response = with_timeout(deadline, || fetcher.fetch(request)).await??;
    Ok(response)
}

/// Background half of stale-while-revalidate.
async fn revalidate(
    fetcher: Arc<dyn Fetcher>,
    connectivity: Connectivity,
    cache: Arc<Cache>,
    request: Request,
    deadline: Option<Duration>,
) -> Result<Response, NetError> {
    let response = fetch_with_deadline(fetcher.as_ref(), &connectivity, &request, deadline).await?;
    if response.ok() {
        if let Err(e) = cache.put(&request, &response).await {
            warn!(url = %request.url, error = %e, "Failed to store revalidated response");
        } else {
            trace!(url = %request.url, "Revalidated");
        }
    }
    Ok(response)
}

impl CacheSupervisor {
    pub(crate) async fn dynamic_cache(&self) -> Arc<Cache> {
        self.storage
            .open_bounded(
                &self.config.dynamic_cache_name(),
                self.config.dynamic_cache_max_entries,
            )
            .await
    }

    async fn fetch_network(
        &self,
        request: &Request,
        deadline: Option<Duration>,
    ) -> Result<Response, NetError> {
        fetch_with_deadline(self.fetcher.as_ref(), &self.connectivity, request, deadline).await
    }

    async fn store_dynamic(&self, request: &Request, response: &Response) {
        if let Err(e) = self.dynamic_cache().await.put(request, response).await {
            warn!(url = %request.url, error = %e, "Failed to write dynamic cache");
        }
    }

    /// Network, then dynamic cache, then (navigations only) the offline page.
    pub(crate) async fn network_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let error = match self
            .fetch_network(request, self.config.deadlines.network_first())
            .await
        {
            Ok(response) => {
                if response.ok() {
                    self.store_dynamic(request, &response).await;
                }
                return Ok(response);
            }
            Err(e) => e,
        };

        debug!(url = %request.url, error = %error, "Network failed, falling back to cache");
        if let Some(cached) = self
            .storage
            .match_in(&self.config.dynamic_cache_name(), request)
            .await
        {
            return Ok(cached);
        }
        if request.is_navigation() {
            if let Some(page) = self.fallback_page().await {
                return Ok(page);
            }
        }
        Err(error.into())
    }

    /// Static cache, then dynamic cache, then network.
    pub(crate) async fn cache_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        for name in [
            self.config.static_cache_name(),
            self.config.dynamic_cache_name(),
        ] {
            if let Some(cached) = self.storage.match_in(&name, request).await {
                trace!(url = %request.url, cache = %name, "Cache hit");
                return Ok(cached);
            }
        }

        let response = self
            .fetch_network(request, self.config.deadlines.cache_first())
            .await?;
        if response.ok() {
            self.store_dynamic(request, &response).await;
        }
        Ok(response)
    }

    /// Cached copy now, fresh copy into the dynamic cache for next time.
    pub(crate) async fn stale_while_revalidate(
        &self,
        request: &Request,
    ) -> Result<Response, ServiceWorkerError> {
        let cache = self.dynamic_cache().await;
        let cached = cache.match_request(request).await;

        let revalidation = self.tasks.spawn(revalidate(
            Arc::clone(&self.fetcher),
            self.connectivity.clone(),
            cache,
            request.clone(),
            self.config.deadlines.revalidate(),
        ));

        if let Some(response) = cached {
            trace!(url = %request.url, "Serving stale copy while revalidating");
            return Ok(response);
        }

        match revalidation.await {
            Ok(result) => result.map_err(ServiceWorkerError::from),
            Err(e) => Err(ServiceWorkerError::StateError(format!(
                "revalidation task failed: {e}"
            ))),
        }
    }

    /// First fallback asset found in the critical cache, then the static cache.
    pub(crate) async fn fallback_page(&self) -> Option<Response> {
        let caches = [
            self.config.critical_cache_name(),
            self.config.static_cache_name(),
        ];
        for path in &self.config.fallback_assets {
            let Ok(request) = self.asset_request(path) else {
                continue;
            };
            for name in &caches {
                if let Some(page) = self.storage.match_in(name, &request).await {
                    debug!(cache = %name, path = %path, "Serving offline page");
                    return Some(page);
                }
            }
        }
        None
    }
}
