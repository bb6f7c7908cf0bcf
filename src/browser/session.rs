use crate::browser::dispatcher::{dispatch_event, run_close_hooks};
use crate::browser::{ShimBrowser, ShimPage};
use crate::core::{BrowserEvent, Config, EngineKind, SessionContext};
use crate::errors::{ExtraError, Result};
use crate::plugins::{Hook, Plugin};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Milestone {
    /// The page-created fan-out for this target id has finished.
    Page(String),
    Disconnected,
}

/// Pages whose fan-out finished but that nobody collected yet. Pages opened
/// outside [`Browser::new_page`] are never collected, so the oldest marks
/// are evicted past this bound.
const MAX_UNCLAIMED_PAGES: usize = 256;

#[derive(Default)]
struct Reached {
    pages: VecDeque<String>,
    disconnected: bool,
}

impl Reached {
    fn contains(&self, milestone: &Milestone) -> bool {
        match milestone {
            Milestone::Page(id) => self.pages.contains(id),
            Milestone::Disconnected => self.disconnected,
        }
    }

    fn remove_page(&mut self, id: &str) {
        self.pages.retain(|page| page != id);
    }
}

/// Milestones reached by the dispatch task, awaitable by the handle.
struct Readiness {
    reached: Mutex<Reached>,
    changed: watch::Sender<u64>,
}

impl Readiness {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            reached: Mutex::new(Reached::default()),
            changed,
        }
    }

    fn mark(&self, milestone: Milestone) {
        {
            let mut reached = self.reached.lock();
            match milestone {
                Milestone::Page(id) => {
                    if !reached.pages.contains(&id) {
                        reached.pages.push_back(id);
                    }
                    while reached.pages.len() > MAX_UNCLAIMED_PAGES {
                        reached.pages.pop_front();
                    }
                }
                Milestone::Disconnected => reached.disconnected = true,
            }
        }
        self.changed.send_modify(|generation| *generation += 1);
    }

    fn forget_page(&self, id: &str) {
        self.reached.lock().remove_page(id);
    }

    fn unclaimed_pages(&self) -> usize {
        self.reached.lock().pages.len()
    }

    /// Resolves once `milestone` has been marked, consuming page milestones.
    async fn wait(&self, milestone: &Milestone) {
        let mut changed = self.changed.subscribe();
        loop {
            {
                let mut reached = self.reached.lock();
                if reached.contains(milestone) {
                    if let Milestone::Page(id) = milestone {
                        reached.remove_page(id);
                    }
                    return;
                }
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The single per-browser task fanning engine events out to plugins.
struct EventPump {
    task: JoinHandle<()>,
    readiness: Arc<Readiness>,
    /// Whether `new_page` has a fan-out to wait for.
    gates_pages: bool,
}

impl EventPump {
    fn spawn(
        browser: Arc<ShimBrowser>,
        plugins: Vec<Arc<dyn Plugin>>,
        mut events: mpsc::UnboundedReceiver<BrowserEvent>,
    ) -> Self {
        let readiness = Arc::new(Readiness::new());
        let gates_pages = plugins
            .iter()
            .any(|p| p.hooks().contains_any(&[Hook::TargetCreated, Hook::PageCreated]));

        let marks = readiness.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch_event(&plugins, &browser, &event).await;

                match event {
                    BrowserEvent::TargetCreated(target) if target.is_page() => {
                        marks.mark(Milestone::Page(target.id));
                    }
                    BrowserEvent::TargetDestroyed(target) => {
                        marks.forget_page(&target.id);
                    }
                    BrowserEvent::Disconnected => {
                        marks.mark(Milestone::Disconnected);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("Event dispatch finished");
        });

        Self {
            task,
            readiness,
            gates_pages,
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(unix)]
async fn exit_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    match streams {
        (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) => {
            tokio::select! {
                _ = interrupt.recv() => info!(signal = "SIGINT", "Exit signal received"),
                _ = terminate.recv() => info!(signal = "SIGTERM", "Exit signal received"),
                _ = hangup.recv() => info!(signal = "SIGHUP", "Exit signal received"),
            }
        }
        _ => {
            warn!("Could not install exit signal handlers, close hooks are not bound to signals");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn exit_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "ctrl-c", "Exit signal received"),
        Err(e) => {
            warn!(error = %e, "Could not install ctrl-c handler, close hooks are not bound to it");
            std::future::pending::<()>().await;
        }
    }
}

async fn process_exit(mut events: mpsc::UnboundedReceiver<BrowserEvent>) {
    while let Some(event) = events.recv().await {
        if matches!(event, BrowserEvent::ProcessExited) {
            return;
        }
    }
}

/// Runs close hooks at most once for one launched browser.
///
/// Triggered by an exit signal, by the browser process exiting or by
/// [`Browser::close`], whichever comes first. Dropping the guard unbinds it.
struct ExitGuard {
    plugins: Vec<Arc<dyn Plugin>>,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ExitGuard {
    fn bind(
        plugins: Vec<Arc<dyn Plugin>>,
        events: mpsc::UnboundedReceiver<BrowserEvent>,
        bind_signals: bool,
    ) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let task = {
            let plugins = plugins.clone();
            let fired = fired.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = exit_signal(), if bind_signals => {}
                    _ = process_exit(events) => debug!("Browser process exited"),
                }
                run_close_hooks(&plugins, &fired).await;
            })
        };
        Self {
            plugins,
            fired,
            task,
        }
    }

    async fn fire(&self) {
        run_close_hooks(&self.plugins, &self.fired).await;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A launched or connected browser with its plugins bound.
///
/// Dropping the handle stops event dispatch and unbinds the exit guard but
/// leaves the browser itself running; call [`Browser::close`] to shut it down.
pub struct Browser {
    shim: Arc<ShimBrowser>,
    context: SessionContext,
    pump: Option<EventPump>,
    exit_guard: Mutex<Option<ExitGuard>>,
    ready_timeout: Duration,
    closed: AtomicBool,
}

impl Browser {
    /// Subscribes to the browser's events and binds the exit guard. Must run
    /// before any `after_*` hook so no early event is missed.
    pub(crate) fn bind(
        shim: Arc<ShimBrowser>,
        context: SessionContext,
        plugins: &[Arc<dyn Plugin>],
        config: &Config,
    ) -> Self {
        let pump = plugins
            .iter()
            .any(|p| p.hooks().contains_any(&Hook::EVENT_DRIVEN))
            .then(|| EventPump::spawn(shim.clone(), plugins.to_vec(), shim.driver().subscribe()));

        let closers: Vec<Arc<dyn Plugin>> = plugins
            .iter()
            .filter(|p| p.hooks().contains(Hook::Close))
            .cloned()
            .collect();
        let exit_guard = (context.is_launch() && !closers.is_empty()).then(|| {
            ExitGuard::bind(closers, shim.driver().subscribe(), config.bind_exit_signals)
        });

        debug!(
            session = %context.id,
            kind = %context.kind,
            dispatching = pump.is_some(),
            exit_guard = exit_guard.is_some(),
            "Browser bound"
        );

        Self {
            shim,
            context,
            pump,
            exit_guard: Mutex::new(exit_guard),
            ready_timeout: config.page_ready_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn shim(&self) -> &Arc<ShimBrowser> {
        &self.shim
    }

    pub fn kind(&self) -> EngineKind {
        self.shim.engine()
    }

    /// Options the engine was started with, after every `before_*` hook.
    pub fn options(&self) -> &Value {
        &self.context.options
    }

    pub fn session_id(&self) -> Uuid {
        self.context.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Opens a page and returns once every plugin has seen it.
    ///
    /// Waits at most the configured page-ready timeout for the page-created
    /// fan-out; on timeout the page is returned anyway.
    pub async fn new_page(&self) -> Result<Arc<ShimPage>> {
        if self.is_closed() {
            return Err(ExtraError::BrowserClosed);
        }
        let page = self.shim.driver().new_page().await?;
        let target_id = page.target_id();

        if let Some(pump) = self.pump.as_ref().filter(|pump| pump.gates_pages) {
            let milestone = Milestone::Page(target_id.clone());
            let ready = pump.readiness.wait(&milestone);
            if tokio::time::timeout(self.ready_timeout, ready).await.is_err() {
                warn!(
                    page = %target_id,
                    timeout_ms = self.ready_timeout.as_millis() as u64,
                    "Page hooks did not finish in time"
                );
            }
        }
        Ok(self.shim.page(&page))
    }

    /// Runs close hooks, closes the browser and waits for the disconnect to
    /// reach plugins. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.exit_guard.lock().take();
        if let Some(guard) = guard {
            guard.fire().await;
        }

        let result = self.shim.driver().close().await;

        if let Some(pump) = &self.pump {
            let disconnected = pump.readiness.wait(&Milestone::Disconnected);
            if tokio::time::timeout(self.ready_timeout, disconnected)
                .await
                .is_err()
            {
                debug!(session = %self.context.id, "No disconnect event after close");
            }
            pump.task.abort();
        }

        info!(session = %self.context.id, "Browser closed");
        result
    }
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("session", &self.context.id)
            .field("kind", &self.context.kind)
            .field("engine", &self.shim.engine())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Engine, Target, TargetKind};
    use crate::testing::{EventLog, MockEngine, TestPlugin};
    use crate::types::SessionKind;
    use serde_json::json;

    async fn bind(engine: &MockEngine, kind: SessionKind, plugins: &[Arc<dyn Plugin>]) -> Browser {
        let driver = match kind {
            SessionKind::Launch => engine.launch(&json!({})).await.unwrap(),
            SessionKind::Connect => engine.connect(&json!({})).await.unwrap(),
        };
        let config = Config::default().with_exit_signals(false);
        Browser::bind(
            ShimBrowser::wrap(engine.kind(), driver),
            SessionContext::new(kind, json!({})),
            plugins,
            &config,
        )
    }

    #[tokio::test]
    async fn readiness_sees_marks_made_before_waiting() {
        let readiness = Readiness::new();
        readiness.mark(Milestone::Page("p".to_string()));
        readiness.wait(&Milestone::Page("p".to_string())).await;
        assert_eq!(readiness.unclaimed_pages(), 0);
    }

    #[tokio::test]
    async fn unclaimed_page_marks_are_bounded() {
        let readiness = Readiness::new();
        for n in 0..(MAX_UNCLAIMED_PAGES + 100) {
            readiness.mark(Milestone::Page(format!("page-{}", n)));
        }
        assert_eq!(readiness.unclaimed_pages(), MAX_UNCLAIMED_PAGES);

        let newest = Milestone::Page(format!("page-{}", MAX_UNCLAIMED_PAGES + 99));
        assert!(readiness.reached.lock().contains(&newest));
        assert!(!readiness.reached.lock().contains(&Milestone::Page("page-0".to_string())));
    }

    #[tokio::test]
    async fn pages_opened_outside_new_page_do_not_pile_up() {
        let plugins: Vec<Arc<dyn Plugin>> =
            vec![Arc::new(TestPlugin::new("pages").hook(Hook::PageCreated))];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        for _ in 0..(MAX_UNCLAIMED_PAGES + 20) {
            browser.shim().driver().new_page().await.unwrap();
        }
        browser.close().await.unwrap();

        let pump = browser.pump.as_ref().unwrap();
        assert_eq!(pump.readiness.unclaimed_pages(), MAX_UNCLAIMED_PAGES);
    }

    #[tokio::test]
    async fn closed_pages_release_their_marks() {
        let plugins: Vec<Arc<dyn Plugin>> =
            vec![Arc::new(TestPlugin::new("pages").hook(Hook::PageCreated))];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        let page = browser.shim().driver().new_page().await.unwrap();
        page.close().await.unwrap();
        browser.close().await.unwrap();

        assert_eq!(browser.pump.as_ref().unwrap().readiness.unclaimed_pages(), 0);
    }

    #[tokio::test]
    async fn target_changes_and_destruction_reach_plugins() {
        let log = EventLog::new();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(
            TestPlugin::new("targets")
                .with_log(log.clone())
                .hook(Hook::TargetChanged)
                .hook(Hook::TargetDestroyed),
        )];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Connect, &plugins).await;

        let page = browser.new_page().await.unwrap();
        page.goto("https://example.com").await.unwrap();
        let mock = engine.last_browser().unwrap();
        mock.emit(BrowserEvent::TargetChanged(Target {
            id: page.target_id(),
            kind: TargetKind::Page,
            url: page.url(),
            page: None,
        }));
        page.close().await.unwrap();
        browser.close().await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["targets:on_target_changed", "targets:on_target_destroyed"]
        );
    }

    #[tokio::test]
    async fn new_page_waits_for_page_hooks() {
        let log = EventLog::new();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(
            TestPlugin::new("pages").with_log(log.clone()).hook(Hook::PageCreated),
        )];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        browser.new_page().await.unwrap();
        assert_eq!(log.entries(), vec!["pages:on_page_created"]);
    }

    #[tokio::test]
    async fn no_event_driven_hooks_means_no_dispatch_task() {
        let plugins: Vec<Arc<dyn Plugin>> =
            vec![Arc::new(TestPlugin::new("quiet").hook(Hook::BeforeLaunch))];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        assert!(browser.pump.is_none());
        assert!(browser.exit_guard.lock().is_none());
        browser.new_page().await.unwrap();
    }

    #[tokio::test]
    async fn close_fires_close_hooks_once_and_reports_disconnect() {
        let log = EventLog::new();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(
            TestPlugin::new("closer")
                .with_log(log.clone())
                .hook(Hook::Close)
                .hook(Hook::Disconnected),
        )];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        browser.close().await.unwrap();
        browser.close().await.unwrap();

        assert_eq!(log.entries(), vec!["closer:on_close", "closer:on_disconnected"]);
        assert!(matches!(browser.new_page().await, Err(ExtraError::BrowserClosed)));
    }

    #[tokio::test]
    async fn process_exit_fires_close_hooks() {
        let log = EventLog::new();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(
            TestPlugin::new("closer").with_log(log.clone()).hook(Hook::Close),
        )];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Launch, &plugins).await;

        engine.last_browser().unwrap().emit(BrowserEvent::ProcessExited);
        for _ in 0..50 {
            if log.count("closer:on_close") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        browser.close().await.unwrap();
        assert_eq!(log.count("closer:on_close"), 1);
    }

    #[tokio::test]
    async fn connected_browsers_have_no_exit_guard() {
        let plugins: Vec<Arc<dyn Plugin>> =
            vec![Arc::new(TestPlugin::new("closer").hook(Hook::Close))];
        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = bind(&engine, SessionKind::Connect, &plugins).await;
        assert!(browser.exit_guard.lock().is_none());
    }
}
