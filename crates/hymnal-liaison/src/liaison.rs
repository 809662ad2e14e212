//! The client liaison.

use std::future::Future;
use std::sync::Arc;

use hymnal_sw::{
    RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerRegistration,
    ServiceWorkerState, WorkerMessage,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::LiaisonConfig;
use crate::notify::{Notification, NotificationAction, NotificationId, NotificationKind, Notifier};
use crate::platform::{InstallChoice, InstallPrompt, PageHost, PlatformEvent, UserAgentClass};
use crate::LiaisonError;

/// What the page shows about the offline stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiaisonState {
    /// An install prompt has been captured.
    pub installable: bool,
    /// The platform reports no connectivity.
    pub offline: bool,
    /// A new generation is waiting to take over.
    pub update_available: bool,
    /// A supervisor was registered for this page.
    pub registered: bool,
}

#[derive(Default)]
struct Inner {
    state: LiaisonState,
    prompt: Option<Arc<dyn InstallPrompt>>,
    install_notice: Option<NotificationId>,
    update_notice: Option<NotificationId>,
}

/// Bridges the page and the cache supervisor.
pub struct ClientLiaison {
    config: LiaisonConfig,
    container: Arc<ServiceWorkerContainer>,
    host: Arc<dyn PageHost>,
    notifier: Arc<dyn Notifier>,
    ua_class: UserAgentClass,
    inner: Mutex<Inner>,
}

impl ClientLiaison {
    pub fn new(
        config: LiaisonConfig,
        container: Arc<ServiceWorkerContainer>,
        host: Arc<dyn PageHost>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ua_class = UserAgentClass::classify(&host.user_agent());
        debug!(?ua_class, "Client liaison created");
        Self {
            config,
            container,
            host,
            notifier,
            ua_class,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> LiaisonState {
        self.inner.lock().await.state
    }

    pub fn user_agent_class(&self) -> UserAgentClass {
        self.ua_class
    }

    /// First mount: pick up connectivity and register the supervisor.
    ///
    /// Registration failure is logged and the page carries on without
    /// offline support.
    pub async fn mount(&self) -> Option<ServiceWorkerRegistration> {
        {
            let mut inner = self.inner.lock().await;
            inner.state.offline = !self.container.connectivity().is_online();
        }

        // iOS never offers a prompt, so explain the manual route up front.
        if self.ua_class == UserAgentClass::Ios {
            self.notifier.notify(Notification::timed(
                NotificationKind::InstallInstructions,
                &self.config.texts.ios_instructions,
                self.config.instructions(),
            ));
        }

        if !self.host.supports_service_workers() {
            info!("Service workers unsupported, running without offline support");
            return None;
        }

        let options = RegistrationOptions {
            scope: self.config.scope.clone(),
            config: self.config.worker.clone(),
        };
        match self.container.register(&self.config.script_path, options).await {
            Ok(registration) => {
                info!(scope = %registration.scope, "Offline support registered");
                self.inner.lock().await.state.registered = true;
                Some(registration)
            }
            Err(e) => {
                error!(script = %self.config.script_path, error = %e, "Service worker registration failed");
                None
            }
        }
    }

    /// Process platform and worker signals until `shutdown` resolves.
    pub async fn run(
        &self,
        mut worker_events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        mut platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut connectivity = self.container.connectivity().subscribe();
        let online = *connectivity.borrow_and_update();
        self.handle_connectivity(online).await;

        let mut worker_open = true;
        let mut platform_open = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!("Liaison shutting down");
                    break;
                }
                event = worker_events.recv(), if worker_open => {
                    match event {
                        Some(event) => self.handle_worker_event(event).await,
                        None => {
                            warn!("Worker event channel closed");
                            worker_open = false;
                        }
                    }
                }
                event = platform_events.recv(), if platform_open => {
                    match event {
                        Some(event) => self.handle_platform_event(event).await,
                        None => {
                            debug!("Platform event channel closed");
                            platform_open = false;
                        }
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        warn!("Connectivity signal dropped");
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    self.handle_connectivity(online).await;
                }
            }
        }
    }

    /// React to a lifecycle event from the container.
    pub async fn handle_worker_event(&self, event: ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::UpdateFound { registration_scope } => {
                debug!(scope = %registration_scope, "Update found");
            }
            ServiceWorkerEvent::StateChange {
                registration_scope,
                new_state: ServiceWorkerState::Installed,
                controlled: true,
                ..
            } => {
                // An installed worker next to an existing controller is an
                // update, not a first install.
                let mut inner = self.inner.lock().await;
                inner.state.update_available = true;
                if inner.update_notice.is_none() {
                    info!(scope = %registration_scope, "Update available");
                    inner.update_notice = Some(self.notifier.notify(Notification::persistent(
                        NotificationKind::UpdateAvailable,
                        &self.config.texts.update_available,
                        NotificationAction::Update,
                    )));
                }
            }
            ServiceWorkerEvent::ControllerChange {
                registration_scope,
                worker_id,
            } => {
                // A generation that skipped waiting already controls the
                // page: the pending update is applied, only a reload is left.
                let mut inner = self.inner.lock().await;
                if !inner.state.update_available {
                    trace!(scope = %registration_scope, worker = worker_id.raw(), "Controller changed");
                    return;
                }
                inner.state.update_available = false;
                if let Some(id) = inner.update_notice.take() {
                    self.notifier.dismiss(id);
                }
                drop(inner);

                info!(scope = %registration_scope, worker = worker_id.raw(), "New generation took control, reloading");
                self.host.reload();
            }
            other => trace!(event = ?other, "Ignoring worker event"),
        }
    }

    /// React to an online/offline transition.
    pub async fn handle_connectivity(&self, online: bool) {
        let mut inner = self.inner.lock().await;
        if inner.state.offline != online {
            return;
        }
        inner.state.offline = !online;

        let (kind, text) = if online {
            (NotificationKind::Online, &self.config.texts.online)
        } else {
            (NotificationKind::Offline, &self.config.texts.offline)
        };
        self.notifier
            .notify(Notification::timed(kind, text, self.config.transient()));
    }

    /// React to an install-related platform signal.
    pub async fn handle_platform_event(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::BeforeInstallPrompt(prompt) => match self.ua_class {
                UserAgentClass::Desktop => {
                    prompt.prevent_default();
                    let mut inner = self.inner.lock().await;
                    inner.prompt = Some(prompt);
                    inner.state.installable = true;
                    if inner.install_notice.is_none() {
                        inner.install_notice = Some(self.notifier.notify(Notification::persistent(
                            NotificationKind::InstallAvailable,
                            &self.config.texts.install_available,
                            NotificationAction::Install,
                        )));
                    }
                }
                UserAgentClass::Ios => {
                    self.notifier.notify(Notification::timed(
                        NotificationKind::InstallInstructions,
                        &self.config.texts.ios_instructions,
                        self.config.instructions(),
                    ));
                }
                UserAgentClass::Mobile => {
                    self.notifier.notify(Notification::timed(
                        NotificationKind::InstallInstructions,
                        &self.config.texts.mobile_instructions,
                        self.config.instructions(),
                    ));
                }
            },
            PlatformEvent::AppInstalled => {
                let mut inner = self.inner.lock().await;
                inner.prompt = None;
                inner.state.installable = false;
                if let Some(id) = inner.install_notice.take() {
                    self.notifier.dismiss(id);
                }
                info!("App installed");
                self.notifier.notify(Notification::timed(
                    NotificationKind::Installed,
                    &self.config.texts.installed,
                    self.config.transient(),
                ));
            }
        }
    }

    /// Show the captured install prompt. `None` if there is nothing to show.
    ///
    /// The prompt is consumed and the install notification dismissed
    /// whatever the user chooses.
    pub async fn install_app(&self) -> Result<Option<InstallChoice>, LiaisonError> {
        let Some(prompt) = self.inner.lock().await.prompt.take() else {
            debug!("No install prompt captured");
            return Ok(None);
        };

        let choice = prompt.prompt().await;

        let mut inner = self.inner.lock().await;
        inner.state.installable = false;
        if let Some(id) = inner.install_notice.take() {
            self.notifier.dismiss(id);
        }
        drop(inner);

        let choice = choice?;
        info!(?choice, "Install prompt answered");
        Ok(Some(choice))
    }

    /// Activate the waiting generation and reload. Returns `false` if no
    /// worker is waiting.
    pub async fn update_app(&self) -> Result<bool, LiaisonError> {
        let lookup = self.config.scope.as_deref().unwrap_or("/");
        let Some(registration) = self.container.get_registration(lookup).await else {
            return Ok(false);
        };
        if registration.waiting.is_none() {
            debug!(scope = %registration.scope, "No waiting worker to activate");
            return Ok(false);
        }

        self.container
            .post_message(registration.scope.as_str(), WorkerMessage::SkipWaiting)
            .await?;

        {
            let mut inner = self.inner.lock().await;
            inner.state.update_available = false;
            if let Some(id) = inner.update_notice.take() {
                self.notifier.dismiss(id);
            }
        }

        info!(scope = %registration.scope, "Update applied, reloading");
        self.host.reload();
        Ok(true)
    }
}
