//! Liaison behavior against a real container and a fake origin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hymnal_liaison::{
    ClientLiaison, InstallChoice, InstallPrompt, LiaisonConfig, LiaisonError, Notification,
    NotificationAction, NotificationId, NotificationKind, NotificationLifetime, Notifier,
    PageHost, PlatformEvent,
};
use hymnal_net::{Connectivity, FakeFetcher, Url};
use hymnal_sw::{ServiceWorkerContainer, ServiceWorkerEvent, SupervisorConfig};
use tokio::sync::mpsc;

const DESKTOP: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
const IPHONE: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1";
const ANDROID: &str =
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Mobile Safari/537.36";

#[derive(Default)]
struct RecordingNotifier {
    shown: Mutex<Vec<(NotificationId, Notification)>>,
    dismissed: Mutex<Vec<NotificationId>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<NotificationKind> {
        self.shown.lock().unwrap().iter().map(|(_, n)| n.kind).collect()
    }

    fn find(&self, kind: NotificationKind) -> Option<(NotificationId, Notification)> {
        self.shown
            .lock()
            .unwrap()
            .iter()
            .find(|(_, n)| n.kind == kind)
            .cloned()
    }

    fn was_dismissed(&self, id: NotificationId) -> bool {
        self.dismissed.lock().unwrap().contains(&id)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> NotificationId {
        let id = NotificationId::new();
        self.shown.lock().unwrap().push((id, notification));
        id
    }

    fn dismiss(&self, id: NotificationId) {
        self.dismissed.lock().unwrap().push(id);
    }
}

struct FakeHost {
    user_agent: &'static str,
    supports_workers: bool,
    reloads: AtomicUsize,
}

impl FakeHost {
    fn new(user_agent: &'static str) -> Self {
        Self {
            user_agent,
            supports_workers: true,
            reloads: AtomicUsize::new(0),
        }
    }
}

impl PageHost for FakeHost {
    fn user_agent(&self) -> String {
        self.user_agent.to_string()
    }

    fn supports_service_workers(&self) -> bool {
        self.supports_workers
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePrompt {
    choice: Result<InstallChoice, String>,
    prevented: AtomicBool,
    prompted: AtomicUsize,
}

impl FakePrompt {
    fn answering(choice: InstallChoice) -> Arc<Self> {
        Arc::new(Self {
            choice: Ok(choice),
            prevented: AtomicBool::new(false),
            prompted: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            choice: Err("prompt already used".into()),
            prevented: AtomicBool::new(false),
            prompted: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl InstallPrompt for FakePrompt {
    fn prevent_default(&self) {
        self.prevented.store(true, Ordering::SeqCst);
    }

    async fn prompt(&self) -> Result<InstallChoice, LiaisonError> {
        self.prompted.fetch_add(1, Ordering::SeqCst);
        self.choice.clone().map_err(LiaisonError::Prompt)
    }
}

struct Page {
    liaison: ClientLiaison,
    container: Arc<ServiceWorkerContainer>,
    events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    host: Arc<FakeHost>,
    notifier: Arc<RecordingNotifier>,
    connectivity: Connectivity,
}

fn origin() -> Arc<FakeFetcher> {
    let fake = Arc::new(FakeFetcher::new());
    fake.route_typed("https://hymnal.app/", "text/html", "<html></html>")
        .route_typed("https://hymnal.app/index.html", "text/html", "<html></html>")
        .route_typed("https://hymnal.app/manifest.json", "application/json", "{}");
    fake
}

fn page_with(host: FakeHost, config: LiaisonConfig) -> Page {
    let connectivity = Connectivity::new(true);
    let (container, events) = ServiceWorkerContainer::new(
        Url::parse("https://hymnal.app/").unwrap(),
        origin(),
        connectivity.clone(),
    );
    let container = Arc::new(container);
    let host = Arc::new(host);
    let notifier = Arc::new(RecordingNotifier::default());
    let liaison = ClientLiaison::new(config, container.clone(), host.clone(), notifier.clone());
    Page {
        liaison,
        container,
        events,
        host,
        notifier,
        connectivity,
    }
}

fn page(user_agent: &'static str) -> Page {
    page_with(FakeHost::new(user_agent), LiaisonConfig::default())
}

async fn drain_events(page: &mut Page) {
    while let Ok(event) = page.events.try_recv() {
        page.liaison.handle_worker_event(event).await;
    }
}

#[tokio::test]
async fn mount_registers_well_known_script() {
    let mut page = page(DESKTOP);
    let registration = page.liaison.mount().await.unwrap();

    assert_eq!(registration.scope.as_str(), "https://hymnal.app/");
    assert_eq!(
        registration.active.unwrap().script_url.as_str(),
        "https://hymnal.app/sw.js"
    );
    assert!(page.liaison.state().await.registered);

    // A first install is not an update.
    drain_events(&mut page).await;
    assert!(!page.liaison.state().await.update_available);
    assert!(page.notifier.kinds().is_empty());
}

#[tokio::test]
async fn mount_without_worker_support_degrades_silently() {
    let host = FakeHost {
        supports_workers: false,
        ..FakeHost::new(DESKTOP)
    };
    let page = page_with(host, LiaisonConfig::default());

    assert!(page.liaison.mount().await.is_none());
    assert!(!page.liaison.state().await.registered);
    assert!(page.container.get_registrations().await.is_empty());
    assert!(page.notifier.kinds().is_empty());
}

#[tokio::test]
async fn failed_registration_is_not_fatal() {
    let config = LiaisonConfig {
        worker: SupervisorConfig {
            cache_first_patterns: vec!["(".into()],
            ..SupervisorConfig::default()
        },
        ..LiaisonConfig::default()
    };
    let page = page_with(FakeHost::new(DESKTOP), config);

    assert!(page.liaison.mount().await.is_none());
    assert!(!page.liaison.state().await.registered);
    assert!(page.notifier.kinds().is_empty());
}

#[tokio::test]
async fn update_detected_and_applied() {
    let mut page = page(DESKTOP);
    page.liaison.mount().await.unwrap();
    drain_events(&mut page).await;

    let update = hymnal_sw::RegistrationOptions {
        config: SupervisorConfig {
            generation: 2,
            skip_waiting_on_install: false,
            ..SupervisorConfig::default()
        },
        ..Default::default()
    };
    let registration = page.container.register("/sw.js", update).await.unwrap();
    let waiting = registration.waiting.clone().unwrap();
    drain_events(&mut page).await;

    assert!(page.liaison.state().await.update_available);
    let (notice, notification) = page.notifier.find(NotificationKind::UpdateAvailable).unwrap();
    assert_eq!(notification.lifetime, NotificationLifetime::Persistent);
    assert_eq!(notification.action, Some(NotificationAction::Update));

    assert!(page.liaison.update_app().await.unwrap());
    assert!(waiting.is_active());
    assert_eq!(page.container.controller().await.unwrap().id, waiting.id);
    assert!(!page.liaison.state().await.update_available);
    assert!(page.notifier.was_dismissed(notice));
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_that_skips_waiting_clears_itself() {
    let mut page = page(DESKTOP);
    page.liaison.mount().await.unwrap();
    drain_events(&mut page).await;

    // Default config: the new generation activates as soon as it installs.
    let update = hymnal_sw::RegistrationOptions {
        config: SupervisorConfig {
            generation: 2,
            ..SupervisorConfig::default()
        },
        ..Default::default()
    };
    let registration = page.container.register("/sw.js", update).await.unwrap();
    assert!(registration.waiting.is_none());
    drain_events(&mut page).await;

    let controller = page.container.controller().await.unwrap();
    assert_eq!(controller.supervisor().config().generation, 2);

    let (notice, _) = page.notifier.find(NotificationKind::UpdateAvailable).unwrap();
    assert!(page.notifier.was_dismissed(notice));
    assert!(!page.liaison.state().await.update_available);
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 1);

    // Nothing left to apply.
    assert!(!page.liaison.update_app().await.unwrap());
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_app_without_waiting_worker_is_noop() {
    let page = page(DESKTOP);
    assert!(!page.liaison.update_app().await.unwrap());

    page.liaison.mount().await.unwrap();
    assert!(!page.liaison.update_app().await.unwrap());
    assert_eq!(page.host.reloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connectivity_notifications() {
    let page = page(DESKTOP);
    page.liaison.mount().await;

    page.liaison.handle_connectivity(false).await;
    assert!(page.liaison.state().await.offline);
    page.liaison.handle_connectivity(false).await;
    page.liaison.handle_connectivity(true).await;
    assert!(!page.liaison.state().await.offline);

    assert_eq!(
        page.notifier.kinds(),
        vec![NotificationKind::Offline, NotificationKind::Online]
    );
    let (_, offline) = page.notifier.find(NotificationKind::Offline).unwrap();
    assert_eq!(offline.lifetime, NotificationLifetime::Timed(Duration::from_secs(3)));
}

#[tokio::test]
async fn desktop_install_prompt_is_deferred() {
    let page = page(DESKTOP);
    let prompt = FakePrompt::answering(InstallChoice::Accepted);

    page.liaison
        .handle_platform_event(PlatformEvent::BeforeInstallPrompt(prompt.clone()))
        .await;
    assert!(prompt.prevented.load(Ordering::SeqCst));
    assert!(page.liaison.state().await.installable);
    let (notice, notification) = page.notifier.find(NotificationKind::InstallAvailable).unwrap();
    assert_eq!(notification.action, Some(NotificationAction::Install));

    let choice = page.liaison.install_app().await.unwrap();
    assert_eq!(choice, Some(InstallChoice::Accepted));
    assert_eq!(prompt.prompted.load(Ordering::SeqCst), 1);
    assert!(!page.liaison.state().await.installable);
    assert!(page.notifier.was_dismissed(notice));

    // The prompt can only be used once.
    assert_eq!(page.liaison.install_app().await.unwrap(), None);
}

#[tokio::test]
async fn dismissed_or_failed_prompt_still_clears_handle() {
    let page = page(DESKTOP);
    page.liaison
        .handle_platform_event(PlatformEvent::BeforeInstallPrompt(FakePrompt::failing()))
        .await;

    assert!(matches!(
        page.liaison.install_app().await,
        Err(LiaisonError::Prompt(_))
    ));
    assert!(!page.liaison.state().await.installable);
    let (notice, _) = page.notifier.find(NotificationKind::InstallAvailable).unwrap();
    assert!(page.notifier.was_dismissed(notice));
}

#[tokio::test]
async fn mobile_keeps_native_prompt() {
    let page = page(ANDROID);
    let prompt = FakePrompt::answering(InstallChoice::Dismissed);
    page.liaison
        .handle_platform_event(PlatformEvent::BeforeInstallPrompt(prompt.clone()))
        .await;

    assert!(!prompt.prevented.load(Ordering::SeqCst));
    assert!(!page.liaison.state().await.installable);
    let (_, hint) = page.notifier.find(NotificationKind::InstallInstructions).unwrap();
    assert_eq!(hint.lifetime, NotificationLifetime::Timed(Duration::from_secs(10)));
    assert_eq!(page.liaison.install_app().await.unwrap(), None);
}

#[tokio::test]
async fn ios_gets_manual_instructions_on_mount() {
    let page = page(IPHONE);
    page.liaison.mount().await;

    let (_, hint) = page.notifier.find(NotificationKind::InstallInstructions).unwrap();
    assert_eq!(hint.message, LiaisonConfig::default().texts.ios_instructions);
}

#[tokio::test]
async fn app_installed_clears_prompt() {
    let page = page(DESKTOP);
    page.liaison
        .handle_platform_event(PlatformEvent::BeforeInstallPrompt(FakePrompt::answering(
            InstallChoice::Accepted,
        )))
        .await;
    page.liaison
        .handle_platform_event(PlatformEvent::AppInstalled)
        .await;

    assert!(!page.liaison.state().await.installable);
    assert_eq!(page.liaison.install_app().await.unwrap(), None);
    assert_eq!(
        page.notifier.kinds(),
        vec![NotificationKind::InstallAvailable, NotificationKind::Installed]
    );
}

#[tokio::test]
async fn run_loop_dispatches_until_shutdown() {
    let Page {
        liaison,
        container,
        events,
        notifier,
        connectivity,
        ..
    } = page(DESKTOP);
    let liaison = Arc::new(liaison);
    let (platform_tx, platform_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let runner = {
        let liaison = liaison.clone();
        tokio::spawn(async move {
            liaison
                .run(events, platform_rx, async {
                    let _ = stop_rx.await;
                })
                .await;
        })
    };

    liaison.mount().await.unwrap();
    let update = hymnal_sw::RegistrationOptions {
        config: SupervisorConfig {
            generation: 2,
            skip_waiting_on_install: false,
            ..SupervisorConfig::default()
        },
        ..Default::default()
    };
    container.register("/sw.js", update).await.unwrap();
    connectivity.set_online(false);
    platform_tx
        .send(PlatformEvent::BeforeInstallPrompt(FakePrompt::answering(
            InstallChoice::Accepted,
        )))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = liaison.state().await;
        if state.update_available && state.offline && state.installable {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "liaison did not catch up: {state:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stop_tx.send(()).unwrap();
    runner.await.unwrap();

    let kinds = notifier.kinds();
    assert!(kinds.contains(&NotificationKind::UpdateAvailable));
    assert!(kinds.contains(&NotificationKind::Offline));
    assert!(kinds.contains(&NotificationKind::InstallAvailable));
}
