//! The cache supervisor: lifecycle handlers and fetch dispatch.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use http::{Method, StatusCode};
use hymnal_net::{Connectivity, Fetcher, Request, Response};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::classify::{RequestClassifier, Strategy};
use crate::config::SupervisorConfig;
use crate::messages::{ClientChannel, ClientMessage, WorkerMessage};
use crate::strategy::fetch_with_deadline;
use crate::{ServiceWorkerError, ServiceWorkerState};

/// Body of the last-resort response for a navigation.
pub const APP_OFFLINE_TEXT: &str = "App unavailable offline";

/// Body of the last-resort response for any other request.
pub const RESOURCE_OFFLINE_TEXT: &str = "Resource unavailable offline";

/// Outcome of the install handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Critical assets stored.
    pub precached: usize,
    /// Why precaching failed, if it did. Install still completes.
    pub precache_error: Option<String>,
    /// Pages that received `SW_INSTALLED`.
    pub clients_notified: usize,
    /// Whether the worker asked to skip the waiting phase.
    pub skip_waiting: bool,
}

/// Outcome of the activate handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale caches removed.
    pub deleted: Vec<String>,
}

/// Background work that extends the event which spawned it.
///
/// The tracker is never closed; idleness is observed through the in-flight
/// count, so any number of callers can wait at once.
#[derive(Debug)]
pub(crate) struct PendingWork {
    tracker: TaskTracker,
    in_flight: Arc<watch::Sender<usize>>,
}

struct InFlight(Arc<watch::Sender<usize>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl PendingWork {
    fn new() -> Self {
        let (in_flight, _rx) = watch::channel(0);
        Self {
            tracker: TaskTracker::new(),
            in_flight: Arc::new(in_flight),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlight(Arc::clone(&self.in_flight));
        self.tracker.spawn(async move {
            let _guard = guard;
            task.await
        })
    }

    pub(crate) fn len(&self) -> usize {
        *self.in_flight.borrow()
    }

    async fn idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// One generation of the offline cache supervisor.
///
/// Holds no state of its own beyond its lifecycle position and the
/// skip-waiting flag; everything else is re-derived from the shared
/// [`CacheStorage`].
pub struct CacheSupervisor {
    pub(crate) config: Arc<SupervisorConfig>,
    classifier: RequestClassifier,
    pub(crate) scope: Url,
    pub(crate) storage: Arc<CacheStorage>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) connectivity: Connectivity,
    clients: ClientChannel,
    state: watch::Sender<ServiceWorkerState>,
    skip_waiting: AtomicBool,
    pub(crate) tasks: PendingWork,
}

impl fmt::Debug for CacheSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSupervisor")
            .field("scope", &self.scope.as_str())
            .field("generation", &self.config.generation)
            .field("state", &self.state())
            .field("pending_tasks", &self.tasks.len())
            .finish()
    }
}

/// Builder for [`CacheSupervisor`].
pub struct SupervisorBuilder {
    scope: Url,
    fetcher: Arc<dyn Fetcher>,
    config: SupervisorConfig,
    storage: Option<Arc<CacheStorage>>,
    connectivity: Option<Connectivity>,
    clients: Option<ClientChannel>,
}

impl SupervisorBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing cache storage.
    pub fn storage(mut self, storage: Arc<CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Observe an existing connectivity signal.
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Broadcast to an existing client channel.
    pub fn clients(mut self, clients: ClientChannel) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Validate the configuration and build the supervisor.
    pub fn build(self) -> Result<CacheSupervisor, ServiceWorkerError> {
        self.config.validate()?;
        let classifier = RequestClassifier::new(&self.config)?;
        let (state, _rx) = watch::channel(ServiceWorkerState::Parsed);

        Ok(CacheSupervisor {
            config: Arc::new(self.config),
            classifier,
            scope: self.scope,
            storage: self.storage.unwrap_or_default(),
            fetcher: self.fetcher,
            connectivity: self.connectivity.unwrap_or_default(),
            clients: self.clients.unwrap_or_default(),
            state,
            skip_waiting: AtomicBool::new(false),
            tasks: PendingWork::new(),
        })
    }
}

impl CacheSupervisor {
    /// Start building a supervisor controlling `scope`.
    pub fn builder(scope: Url, fetcher: Arc<dyn Fetcher>) -> SupervisorBuilder {
        SupervisorBuilder {
            scope,
            fetcher,
            config: SupervisorConfig::default(),
            storage: None,
            connectivity: None,
            clients: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceWorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(generation = self.config.generation, from = %previous, to = %state, "Worker state changed");
        }
    }

    /// Retire this generation. It stops intercepting fetches.
    pub fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant);
    }

    /// Whether this generation asked to activate without waiting.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    // ==================== Install ====================

    /// Install handler.
    ///
    /// Pre-warms the critical cache. A precache failure is logged and does
    /// not abort the install.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let state = self.state();
        if state != ServiceWorkerState::Parsed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot install a worker that is {state}"
            )));
        }
        self.set_state(ServiceWorkerState::Installing);

        let mut report = InstallReport::default();
        let cache_name = self.config.critical_cache_name();
        match self.precache(&cache_name).await {
            Ok(count) => {
                info!(cache = %cache_name, assets = count, "Critical assets cached");
                report.precached = count;
                report.clients_notified = self.clients.publish(ClientMessage::SwInstalled {
                    message: self.config.installed_message.clone(),
                });
            }
            Err(e) => {
                error!(cache = %cache_name, error = %e, "Failed to cache critical assets");
                report.precache_error = Some(e.to_string());
            }
        }

        if self.config.skip_waiting_on_install {
            self.skip_waiting.store(true, Ordering::SeqCst);
        }
        report.skip_waiting = self.skip_waiting_requested();

        self.set_state(ServiceWorkerState::Installed);
        Ok(report)
    }

    /// Fetch every critical asset and store them only if all succeeded.
    async fn precache(&self, cache_name: &str) -> Result<usize, ServiceWorkerError> {
        let cache = self.storage.open(cache_name).await;

        let requests = self
            .config
            .critical_assets
            .iter()
            .map(|path| self.asset_request(path))
            .collect::<Result<Vec<_>, _>>()?;

        let deadline = self.config.deadlines.cache_first();
        let results = join_all(requests.iter().map(|request| {
            fetch_with_deadline(self.fetcher.as_ref(), &self.connectivity, request, deadline)
        }))
        .await;

        let mut fetched = Vec::with_capacity(requests.len());
        for (request, result) in requests.iter().zip(results) {
            let response = result?;
            if !response.ok() {
                return Err(ServiceWorkerError::CacheError(format!(
                    "{} answered {}",
                    request.url, response.status
                )));
            }
            fetched.push((request, response));
        }

        for (request, response) in &fetched {
            cache.put(request, response).await?;
        }
        Ok(fetched.len())
    }

    pub(crate) fn asset_request(&self, path: &str) -> Result<Request, ServiceWorkerError> {
        self.scope
            .join(path)
            .map(Request::get)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad asset path {path}: {e}")))
    }

    // ==================== Activate ====================

    /// Activate handler. Deletes caches of other generations.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        let state = self.state();
        if state != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate a worker that is {state}"
            )));
        }
        self.set_state(ServiceWorkerState::Activating);

        let mut report = ActivateReport::default();
        for name in self.storage.keys().await {
            if self.config.is_stale_cache(&name) && self.storage.delete(&name).await {
                info!(cache = %name, "Deleted stale cache");
                report.deleted.push(name);
            }
        }

        self.storage
            .open_bounded(
                &self.config.dynamic_cache_name(),
                self.config.dynamic_cache_max_entries,
            )
            .await;

        self.set_state(ServiceWorkerState::Activated);
        info!(generation = self.config.generation, deleted = report.deleted.len(), "Worker activated");
        Ok(report)
    }

    // ==================== Fetch ====================

    /// Fetch handler.
    ///
    /// Returns `None` for requests the supervisor does not intercept
    /// (non-GET, non-http(s), or before activation); the caller sends those
    /// to the network itself. An intercepted request always yields a
    /// response: when every fallback is exhausted it is a plain-text 503.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET || !request.is_http() {
            trace!(url = %request.url, method = %request.method, "Passing through");
            return None;
        }
        if !self.state().can_intercept_fetch() {
            debug!(url = %request.url, state = %self.state(), "Not intercepting before activation");
            return None;
        }

        if !self.connectivity.is_online() && self.classifier.is_analytics(&request.url) {
            debug!(url = %request.url, "Dropping analytics request while offline");
            return Some(Response::no_content(request.url.clone()));
        }

        let class = self.classifier.classify(request);
        trace!(url = %request.url, ?class, "Classified request");

        let result = match class.strategy() {
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        };

        Some(match result {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "No response available");
                self.last_resort(request).await
            }
        })
    }

    async fn last_resort(&self, request: &Request) -> Response {
        if request.is_navigation() {
            if let Some(page) = self.fallback_page().await {
                return page;
            }
            return Response::plain_text(
                request.url.clone(),
                StatusCode::SERVICE_UNAVAILABLE,
                APP_OFFLINE_TEXT,
            );
        }
        Response::plain_text(
            request.url.clone(),
            StatusCode::SERVICE_UNAVAILABLE,
            RESOURCE_OFFLINE_TEXT,
        )
    }

    // ==================== Messages ====================

    /// Message handler.
    pub fn handle_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::SkipWaiting => {
                info!(generation = self.config.generation, "Skip waiting requested");
                self.skip_waiting.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Handle a JSON control message. Returns `false` if it was not recognized.
    pub fn handle_raw_message(&self, raw: &str) -> bool {
        match WorkerMessage::from_json(raw) {
            Some(message) => {
                self.handle_message(message);
                true
            }
            None => {
                debug!(raw, "Ignoring unrecognized message");
                false
            }
        }
    }

    // ==================== Lifetime ====================

    /// Wait for all background work spawned by fetch handlers.
    pub async fn wait_until_idle(&self) {
        self.tasks.idle().await;
    }
}
