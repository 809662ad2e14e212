//! Scriptable in-memory [`Fetcher`] for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: Bytes,
}

/// Fake network with fixed routes, a reachability switch and call counters.
///
/// Unknown URLs answer 404. While unreachable, every fetch fails with
/// [`NetError::Unreachable`] but is still counted.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl FakeFetcher {
    /// Create an empty, reachable fake network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with `status` for `url`.
    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.insert(url, status, None, body.into())
    }

    /// Serve `body` as `content_type` with status 200 for `url`.
    pub fn route_typed(&self, url: &str, content_type: &'static str, body: impl Into<Bytes>) -> &Self {
        self.insert(url, 200, Some(content_type), body.into())
    }

    fn insert(&self, url: &str, status: u16, content_type: Option<&'static str>, body: Bytes) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(
                url.to_string(),
                Route {
                    status,
                    content_type,
                    body,
                },
            );
        }
        self
    }

    /// Make the network (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Number of fetches issued for `url`.
    pub fn calls_for(&self, url: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| c.as_str() == url).count())
            .unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.clone());
        }

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            trace!(%url, "Fake network unreachable");
            return Err(NetError::Unreachable(url));
        }

        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(&url).cloned());

        let response = match route {
            Some(route) => {
                let mut headers = HeaderMap::new();
                if let Some(content_type) = route.content_type {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                Response::new(request.url.clone(), route.status, headers, route.body)
            }
            None => Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            ),
        };
        Ok(response)
    }
}
