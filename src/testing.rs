//! In-memory engine and a configurable plugin for exercising the
//! orchestrator without a real browser.

use crate::browser::{ShimBrowser, ShimPage};
use crate::core::session::requests_headless;
use crate::core::{
    BrowserDriver, BrowserEvent, BrowserFamily, CdpSession, Engine, EngineKind, EventHub,
    PageDriver, SessionContext, Target, TargetKind,
};
use crate::errors::{ExtraError, Result};
use crate::plugins::builtin::launch_args::append_args;
use crate::plugins::{DataBus, Hook, HookSet, Plugin};
use crate::types::{DataRecord, Dependency, Requirement, Requirements};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::io;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

pub const HEADLESS_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) HeadlessChrome/120.0.0.0 Safari/537.36";
pub const HEADFUL_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Shared, ordered record of things that happened.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// Captures formatted `tracing` output for assertions.
#[derive(Debug, Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with a subscriber writing every event into this capture.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Engine that hands out [`MockBrowser`]s.
pub struct MockEngine {
    kind: EngineKind,
    family: BrowserFamily,
    fail_launch: bool,
    launches: Mutex<Vec<Value>>,
    connects: Mutex<Vec<Value>>,
    browsers: Mutex<Vec<Arc<MockBrowser>>>,
}

impl MockEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            family: BrowserFamily::Chromium,
            fail_launch: false,
            launches: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            browsers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_family(mut self, family: BrowserFamily) -> Self {
        self.family = family;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Options every launch call received, in order.
    pub fn launched_options(&self) -> Vec<Value> {
        self.launches.lock().clone()
    }

    pub fn connected_options(&self) -> Vec<Value> {
        self.connects.lock().clone()
    }

    pub fn last_browser(&self) -> Option<Arc<MockBrowser>> {
        self.browsers.lock().last().cloned()
    }

    fn open(&self, options: &Value) -> Arc<MockBrowser> {
        let user_agent = if requests_headless(options) {
            HEADLESS_USER_AGENT
        } else {
            HEADFUL_USER_AGENT
        };
        let browser = Arc::new(MockBrowser::new(self.kind, self.family, user_agent));
        self.browsers.lock().push(browser.clone());
        browser
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn launch(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>> {
        self.launches.lock().push(options.clone());
        if self.fail_launch {
            return Err(ExtraError::LaunchFailed("mock engine refused".to_string()));
        }
        Ok(self.open(options))
    }

    async fn connect(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>> {
        self.connects.lock().push(options.clone());
        if self.fail_launch {
            return Err(ExtraError::ConnectFailed("mock engine refused".to_string()));
        }
        Ok(self.open(options))
    }
}

/// Browser that emits a `TargetCreated` event from inside `new_page`,
/// before the page is returned.
pub struct MockBrowser {
    kind: EngineKind,
    family: BrowserFamily,
    user_agent: String,
    events: Arc<EventHub>,
    pages: Mutex<Vec<Arc<MockPage>>>,
    next_page: AtomicUsize,
    sessions_opened: Arc<AtomicUsize>,
    connected: AtomicBool,
}

impl MockBrowser {
    fn new(kind: EngineKind, family: BrowserFamily, user_agent: &str) -> Self {
        Self {
            kind,
            family,
            user_agent: user_agent.to_string(),
            events: Arc::new(EventHub::new()),
            pages: Mutex::new(Vec::new()),
            next_page: AtomicUsize::new(1),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            connected: AtomicBool::new(true),
        }
    }

    fn supports_cdp(&self) -> bool {
        self.family == BrowserFamily::Chromium
    }

    /// Emit an arbitrary event to every subscriber.
    pub fn emit(&self, event: BrowserEvent) {
        self.events.emit(event);
    }

    pub fn page_target(page: &Arc<MockPage>) -> Target {
        Target {
            id: page.id.clone(),
            kind: TargetKind::Page,
            url: page.url(),
            page: Some(page.clone() as Arc<dyn PageDriver>),
        }
    }

    /// DevTools sessions opened on the browser or any of its pages.
    pub fn cdp_sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Drop the browser's own references to its pages.
    pub fn forget_pages(&self) {
        self.pages.lock().clear();
    }
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    fn family(&self) -> BrowserFamily {
        self.family
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrowserEvent> {
        self.events.subscribe()
    }

    async fn new_page(&self) -> Result<Arc<dyn PageDriver>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ExtraError::BrowserClosed);
        }
        let id = format!("page-{}", self.next_page.fetch_add(1, Ordering::SeqCst));
        let page = Arc::new(MockPage {
            id,
            kind: self.kind,
            supports_cdp: self.supports_cdp(),
            url: Mutex::new("about:blank".to_string()),
            user_agent: Arc::new(Mutex::new(self.user_agent.clone())),
            sessions_opened: self.sessions_opened.clone(),
            events: self.events.clone(),
            closed: AtomicBool::new(false),
        });
        self.pages.lock().push(page.clone());
        self.emit(BrowserEvent::TargetCreated(Self::page_target(&page)));
        Ok(page)
    }

    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>> {
        Ok(self
            .pages
            .lock()
            .iter()
            .map(|page| page.clone() as Arc<dyn PageDriver>)
            .collect())
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.forget_pages();
            self.emit(BrowserEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>> {
        if !self.supports_cdp() {
            return Ok(None);
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn CdpSession> = Arc::new(MockCdpSession::new(Arc::new(Mutex::new(
            self.user_agent.clone(),
        ))));
        Ok(Some(session))
    }

    async fn user_agent(&self) -> Result<String> {
        match self.kind {
            EngineKind::Cdp => Ok(self.user_agent.clone()),
            EngineKind::Playwright => Err(ExtraError::unsupported(
                self.kind,
                "Browser.userAgent",
            )),
        }
    }
}

pub struct MockPage {
    id: String,
    kind: EngineKind,
    supports_cdp: bool,
    url: Mutex<String>,
    user_agent: Arc<Mutex<String>>,
    sessions_opened: Arc<AtomicUsize>,
    events: Arc<EventHub>,
    closed: AtomicBool,
}

impl MockPage {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageDriver for MockPage {
    fn target_id(&self) -> String {
        self.id.clone()
    }

    fn url(&self) -> String {
        self.url.lock().clone()
    }

    async fn goto(&self, url: &str) -> Result<()> {
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        match expression {
            "navigator.userAgent" => Ok(json!(self.user_agent.lock().clone())),
            "location.href" => Ok(json!(self.url())),
            _ => Ok(Value::Null),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(BrowserEvent::TargetDestroyed(Target {
                id: self.id.clone(),
                kind: TargetKind::Page,
                url: self.url(),
                page: None,
            }));
        }
        Ok(())
    }

    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>> {
        if !self.supports_cdp {
            return Ok(None);
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn CdpSession> = Arc::new(MockCdpSession::new(self.user_agent.clone()));
        Ok(Some(session))
    }

    async fn set_user_agent(
        &self,
        user_agent: &str,
        _accept_language: Option<&str>,
        _platform: Option<&str>,
    ) -> Result<()> {
        match self.kind {
            EngineKind::Cdp => {
                *self.user_agent.lock() = user_agent.to_string();
                Ok(())
            }
            EngineKind::Playwright => Err(ExtraError::unsupported(self.kind, "Page.setUserAgent")),
        }
    }
}

/// Session that understands the handful of methods the shim relies on.
pub struct MockCdpSession {
    user_agent: Arc<Mutex<String>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl MockCdpSession {
    fn new(user_agent: Arc<Mutex<String>>) -> Self {
        Self {
            user_agent,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CdpSession for MockCdpSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.sent.lock().push((method.to_string(), params.clone()));
        match method {
            "Network.setUserAgentOverride" => {
                let user_agent = params
                    .get("userAgent")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExtraError::InvalidOptions("userAgent is required".to_string()))?;
                *self.user_agent.lock() = user_agent.to_string();
                Ok(json!({}))
            }
            "Browser.getVersion" => Ok(json!({
                "product": "Chrome/120.0.0.0",
                "userAgent": self.user_agent.lock().clone(),
            })),
            _ => Ok(Value::Null),
        }
    }
}

/// A plugin whose declarations and behavior are set up by its builder.
///
/// Every hook it declares logs `"<name>:<hook>"` to its [`EventLog`].
pub struct TestPlugin {
    name: String,
    requirements: Requirements,
    dependencies: Vec<Dependency>,
    data: Mutex<Vec<DataRecord>>,
    hooks: HookSet,
    log: EventLog,
    launch_args: Vec<String>,
    fail_in: Option<Hook>,
    observed: Mutex<Vec<Value>>,
    bus: OnceLock<DataBus>,
}

impl TestPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: Requirements::new(),
            dependencies: Vec::new(),
            data: Mutex::new(Vec::new()),
            hooks: HookSet::empty(),
            log: EventLog::new(),
            launch_args: Vec::new(),
            fail_in: None,
            observed: Mutex::new(Vec::new()),
            bus: OnceLock::new(),
        }
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requirements = self.requirements.with(requirement);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn publishes(self, name: &str, value: impl Into<Value>) -> Self {
        self.publish_now(name, value);
        self
    }

    /// Add a record after construction; later queries see it.
    pub fn publish_now(&self, name: &str, value: impl Into<Value>) {
        self.data.lock().push(DataRecord::new(name, value));
    }

    pub fn hook(mut self, hook: Hook) -> Self {
        self.hooks = self.hooks.with(hook);
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Declare `before_launch`/`before_connect` and append `arg` to the
    /// options' `args` in both.
    pub fn appends_arg(mut self, arg: impl Into<String>) -> Self {
        self.launch_args.push(arg.into());
        self.hooks = self.hooks.with(Hook::BeforeLaunch).with(Hook::BeforeConnect);
        self
    }

    /// Make `hook` fail after logging.
    pub fn fails_in(mut self, hook: Hook) -> Self {
        self.fail_in = Some(hook);
        self.hooks = self.hooks.with(hook);
        self
    }

    /// Options received by `before_*` hooks, in call order.
    pub fn observed_options(&self) -> Vec<Value> {
        self.observed.lock().clone()
    }

    pub fn data_bus(&self) -> Option<DataBus> {
        self.bus.get().cloned()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    fn record(&self, hook: Hook) -> anyhow::Result<()> {
        self.log.push(format!("{}:{}", self.name, hook));
        if self.fail_in == Some(hook) {
            anyhow::bail!("{} failed on purpose", hook);
        }
        Ok(())
    }

    fn waterfall(&self, hook: Hook, options: &Value) -> anyhow::Result<Option<Value>> {
        self.observed.lock().push(options.clone());
        self.record(hook)?;
        if self.launch_args.is_empty() {
            return Ok(None);
        }
        Ok(Some(append_args(options, &self.launch_args)))
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Requirements {
        self.requirements.clone()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }

    fn data(&self) -> Vec<DataRecord> {
        self.data.lock().clone()
    }

    fn hooks(&self) -> HookSet {
        self.hooks
    }

    fn attach_data_bus(&self, bus: DataBus) {
        let _ = self.bus.set(bus);
    }

    fn on_plugin_registered(&self) {
        self.log.push(format!("{}:{}", self.name, Hook::PluginRegistered));
    }

    async fn before_launch(&self, options: &Value) -> anyhow::Result<Option<Value>> {
        self.waterfall(Hook::BeforeLaunch, options)
    }

    async fn after_launch(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        self.record(Hook::AfterLaunch)
    }

    async fn before_connect(&self, options: &Value) -> anyhow::Result<Option<Value>> {
        self.waterfall(Hook::BeforeConnect, options)
    }

    async fn after_connect(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        self.record(Hook::AfterConnect)
    }

    async fn on_browser(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        self.record(Hook::Browser)
    }

    async fn on_target_created(&self, _target: &Target) -> anyhow::Result<()> {
        self.record(Hook::TargetCreated)
    }

    async fn on_page_created(&self, _page: Arc<ShimPage>) -> anyhow::Result<()> {
        self.record(Hook::PageCreated)
    }

    async fn on_target_changed(&self, _target: &Target) -> anyhow::Result<()> {
        self.record(Hook::TargetChanged)
    }

    async fn on_target_destroyed(&self, _target: &Target) -> anyhow::Result<()> {
        self.record(Hook::TargetDestroyed)
    }

    async fn on_disconnected(&self) -> anyhow::Result<()> {
        self.record(Hook::Disconnected)
    }

    async fn on_close(&self) -> anyhow::Result<()> {
        self.record(Hook::Close)
    }
}
