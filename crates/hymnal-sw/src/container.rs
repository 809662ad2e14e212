//! Page-side view of service worker registrations (`navigator.serviceWorker`).

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use hymnal_net::{Connectivity, Fetcher, Request, Response};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::SupervisorConfig;
use crate::messages::{ClientChannel, ClientMessage, WorkerMessage};
use crate::strategy::fetch_with_deadline;
use crate::supervisor::{ActivateReport, CacheSupervisor};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

// ==================== Worker ====================

/// Handle to one registered worker generation.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Worker ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    supervisor: Arc<CacheSupervisor>,
}

impl ServiceWorker {
    fn new(script_url: Url, supervisor: Arc<CacheSupervisor>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            supervisor,
        }
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        self.supervisor.state()
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state() == ServiceWorkerState::Redundant
    }

    /// The supervisor running this generation.
    pub fn supervisor(&self) -> &Arc<CacheSupervisor> {
        &self.supervisor
    }

    /// Deliver a control message.
    pub fn post_message(&self, message: WorkerMessage) {
        self.supervisor.handle_message(message);
    }
}

// ==================== Registration ====================

/// Registration options.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope, resolved against the script URL. Defaults to the script's directory.
    pub scope: Option<String>,

    /// Configuration of the generation being registered.
    pub config: SupervisorConfig,
}

/// A service worker registration.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Move the installing worker to waiting. A worker already waiting is
    /// superseded.
    fn install_complete(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        let worker = self.installing.take()?;
        self.waiting.replace(worker)
    }

    /// Promote the waiting worker. Returns the previous active worker.
    fn activate(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        match self.waiting.take() {
            Some(worker) if worker.id == id => Ok(self.active.replace(worker)),
            other => {
                self.waiting = other;
                Err(ServiceWorkerError::StateError(
                    "worker is no longer waiting".to_string(),
                ))
            }
        }
    }

    fn workers(&self) -> impl Iterator<Item = &ServiceWorker> {
        self.installing
            .iter()
            .chain(self.waiting.iter())
            .chain(self.active.iter())
    }
}

// ==================== Events ====================

/// Lifecycle events observed by the page.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
        /// Whether the page had a controller when the change happened.
        controlled: bool,
    },
    /// The page is now controlled by `worker_id`.
    ControllerChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Container ====================

/// Service worker container for one origin.
pub struct ServiceWorkerContainer {
    origin: Url,

    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Worker controlling the page.
    controller: Arc<RwLock<Option<ServiceWorker>>>,

    /// Cache storage shared by every generation.
    caches: Arc<CacheStorage>,

    fetcher: Arc<dyn Fetcher>,
    connectivity: Connectivity,
    clients: ClientChannel,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container for `origin`.
    pub fn new(
        origin: Url,
        fetcher: Arc<dyn Fetcher>,
        connectivity: Connectivity,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                origin,
                registrations: Arc::new(RwLock::new(HashMap::new())),
                controller: Arc::new(RwLock::new(None)),
                caches: Arc::new(CacheStorage::new()),
                fetcher,
                connectivity,
                clients: ClientChannel::default(),
                event_tx,
            },
            event_rx,
        )
    }

    /// Use previously persisted cache storage.
    pub fn with_storage(mut self, caches: Arc<CacheStorage>) -> Self {
        self.caches = caches;
        self
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Cache storage shared by every generation.
    pub fn caches(&self) -> Arc<CacheStorage> {
        Arc::clone(&self.caches)
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Subscribe to broadcasts from workers.
    pub fn client_messages(&self) -> broadcast::Receiver<ClientMessage> {
        self.clients.subscribe()
    }

    /// The worker controlling the page, if any.
    pub async fn controller(&self) -> Option<ServiceWorker> {
        self.controller.read().await.clone()
    }

    /// Register a service worker and run it through install, and through
    /// activation when nothing is active yet or it asked to skip waiting.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<ServiceWorkerRegistration, ServiceWorkerError> {
        let script_url = self
            .origin
            .join(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        self.check_same_origin(&script_url)?;

        let script_dir = match script_url.path().rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => "/".to_string(),
        };
        let scope = match options.scope {
            Some(s) => script_url
                .join(&s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => script_url
                .join(&script_dir)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        };
        self.check_same_origin(&scope)?;
        if !scope.path().starts_with(&script_dir) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {scope} is outside the script directory {script_dir}"
            )));
        }
        let scope_key = scope.to_string();

        let supervisor = CacheSupervisor::builder(scope.clone(), Arc::clone(&self.fetcher))
            .config(options.config)
            .storage(Arc::clone(&self.caches))
            .connectivity(self.connectivity.clone())
            .clients(self.clients.clone())
            .build()?;
        let worker = ServiceWorker::new(script_url.clone(), Arc::new(supervisor));

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));
            if let Some(previous) = registration.installing.replace(worker.clone()) {
                previous.supervisor.mark_redundant();
            }
            registration.last_update_check = Some(Instant::now());
        }
        info!(script = %script_url, scope = %scope_key, "Service worker registered");
        let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });

        let report = worker.supervisor.install().await?;
        debug!(scope = %scope_key, ?report, "Install finished");

        let activate_now = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_key)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_key.clone()))?;
            if let Some(superseded) = registration.install_complete(worker.id) {
                superseded.supervisor.mark_redundant();
                self.emit_state(&scope_key, &superseded).await;
            }
            registration.active.is_none() || worker.supervisor.skip_waiting_requested()
        };
        self.emit_state(&scope_key, &worker).await;

        if activate_now {
            self.activate_worker(&scope_key, &worker).await?;
        } else {
            info!(scope = %scope_key, "New worker waiting for activation");
        }

        self.registration_snapshot(&scope_key).await
    }

    fn check_same_origin(&self, url: &Url) -> Result<(), ServiceWorkerError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::SecurityError(format!(
                "unsupported scheme: {url}"
            )));
        }
        if url.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "{url} is not same-origin with {}",
                self.origin
            )));
        }
        Ok(())
    }

    async fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        let controlled = self.controller.read().await.is_some();
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
            new_state: worker.state(),
            controlled,
        });
    }

    async fn registration_snapshot(
        &self,
        scope: &str,
    ) -> Result<ServiceWorkerRegistration, ServiceWorkerError> {
        self.registrations
            .read()
            .await
            .get(scope)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))
    }

    /// Activate the waiting worker of `scope` and let it claim the page.
    pub async fn activate(&self, scope: &str) -> Result<ActivateReport, ServiceWorkerError> {
        let worker = self
            .registrations
            .read()
            .await
            .get(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?
            .waiting
            .clone()
            .ok_or_else(|| ServiceWorkerError::StateError(format!("no waiting worker in {scope}")))?;
        self.activate_worker(scope, &worker).await
    }

    async fn activate_worker(
        &self,
        scope: &str,
        worker: &ServiceWorker,
    ) -> Result<ActivateReport, ServiceWorkerError> {
        let previous = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.activate(worker.id)?
        };
        if let Some(old) = &previous {
            old.supervisor.mark_redundant();
            self.emit_state(scope, old).await;
        }

        let report = worker.supervisor.activate().await?;

        // Claim: take control without waiting for a navigation.
        *self.controller.write().await = Some(worker.clone());
        self.emit_state(scope, worker).await;
        let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
        });

        info!(scope, worker = worker.id.raw(), "Service worker controls the page");
        Ok(report)
    }

    /// Post a control message to the newest worker of `scope`. A
    /// `SKIP_WAITING` sent to a waiting worker activates it immediately.
    pub async fn post_message(
        &self,
        scope: &str,
        message: WorkerMessage,
    ) -> Result<(), ServiceWorkerError> {
        let (target, waiting) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            match (&registration.waiting, &registration.active) {
                (Some(w), _) => (w.clone(), true),
                (None, Some(a)) => (a.clone(), false),
                (None, None) => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "no worker to message in {scope}"
                    )))
                }
            }
        };

        target.post_message(message);
        if waiting && target.supervisor.skip_waiting_requested() {
            self.activate_worker(scope, &target).await?;
        }
        Ok(())
    }

    /// Fetch on behalf of the page: through the controller when there is
    /// one, straight to the network otherwise.
    pub async fn fetch(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let controller = self.controller().await;
        if let Some(worker) = controller {
            if let Some(response) = worker.supervisor.handle_fetch(request).await {
                return Ok(response);
            }
        }
        Ok(fetch_with_deadline(self.fetcher.as_ref(), &self.connectivity, request, None).await?)
    }

    /// Registration whose scope is the longest prefix of `url`.
    pub async fn get_registration(&self, url: &str) -> Option<ServiceWorkerRegistration> {
        let url = self.origin.join(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(_, registration)| registration.clone())
    }

    /// All registered scopes, sorted.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Unregister `scope`. Its workers become redundant.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let Some(registration) = self.registrations.write().await.remove(scope) else {
            return Ok(false);
        };
        for worker in registration.workers() {
            worker.supervisor.mark_redundant();
        }

        let mut controller = self.controller.write().await;
        let controlled_by_scope = controller
            .as_ref()
            .is_some_and(|c| registration.workers().any(|w| w.id == c.id));
        if controlled_by_scope {
            *controller = None;
        }

        warn!(scope, "Service worker unregistered");
        Ok(true)
    }
}
