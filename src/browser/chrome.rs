use crate::core::session::requests_headless;
use crate::core::{
    BrowserDriver, BrowserEvent, BrowserFamily, CdpSession, Engine, EngineKind, EventHub,
    PageDriver, Target, TargetKind,
};
use crate::errors::{ExtraError, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_WINDOW: (u32, u32) = (1280, 720);

/// Primary engine: drives Chromium over the DevTools protocol.
///
/// Recognized launch options: `headless` (default `true`), `args`,
/// `executablePath` and `defaultViewport: {width, height}`. Connect needs
/// `browserWSEndpoint`.
#[derive(Debug, Default, Clone)]
pub struct ChromeEngine;

impl ChromeEngine {
    pub fn new() -> Self {
        Self
    }
}

fn window_size(options: &Value) -> (u32, u32) {
    let viewport = options.get("defaultViewport");
    let dimension = |key: &str, fallback: u32| {
        viewport
            .and_then(|v| v.get(key))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(fallback)
    };
    (dimension("width", DEFAULT_WINDOW.0), dimension("height", DEFAULT_WINDOW.1))
}

fn launch_args(options: &Value) -> Result<Vec<String>> {
    match options.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ExtraError::InvalidOptions(format!("launch argument is not a string: {}", item))
                })
            })
            .collect(),
        Some(other) => Err(ExtraError::InvalidOptions(format!(
            "args must be an array, got {}",
            other
        ))),
    }
}

/// Accepts only `ws://` and `wss://` endpoints.
pub fn parse_ws_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ExtraError::InvalidOptions(format!("browserWSEndpoint '{}': {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(ExtraError::InvalidOptions(format!(
            "browserWSEndpoint must use ws or wss, got '{}'",
            scheme
        ))),
    }
}

#[async_trait]
impl Engine for ChromeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cdp
    }

    async fn launch(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>> {
        let headless = match options.get("headless") {
            None | Some(Value::Null) => true,
            Some(_) => requests_headless(options),
        };
        let (width, height) = window_size(options);
        let window_size_arg = format!("--window-size={},{}", width, height);
        let extra_args = launch_args(options)?;

        let mut args = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new(&window_size_arg),
        ];
        for arg in &extra_args {
            args.push(OsStr::new(arg));
        }

        let path = options
            .get("executablePath")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let launch_options = LaunchOptions::default_builder()
            .headless(headless)
            .path(path)
            .args(args)
            .build()
            .map_err(|e| ExtraError::LaunchFailed(e.to_string()))?;

        let browser =
            Browser::new(launch_options).map_err(|e| ExtraError::LaunchFailed(e.to_string()))?;
        info!(headless = headless, args = extra_args.len(), "Chrome launched");

        Ok(Arc::new(ChromeBrowser::new(browser, true)))
    }

    async fn connect(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>> {
        let endpoint = options
            .get("browserWSEndpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtraError::InvalidOptions("browserWSEndpoint is required".to_string()))?;
        let url = parse_ws_endpoint(endpoint)?;

        let browser = Browser::connect(url.to_string())
            .map_err(|e| ExtraError::ConnectFailed(e.to_string()))?;
        info!(endpoint = %url, "Connected to Chrome");

        Ok(Arc::new(ChromeBrowser::new(browser, false)))
    }
}

/// How often the tab list is diffed into target events.
const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn open_tabs(browser: &Browser) -> Result<Vec<Arc<Tab>>> {
    let tabs = browser
        .get_tabs()
        .lock()
        .map_err(|e| ExtraError::ChromeError(e.to_string()))?
        .clone();
    Ok(tabs)
}

fn chrome_page(
    tab: Arc<Tab>,
    browser: Weak<Browser>,
    targets: Weak<TargetTracker>,
) -> Arc<dyn PageDriver> {
    Arc::new(ChromePage {
        tab,
        browser,
        targets,
    })
}

struct TrackedTarget {
    url: String,
    page: Arc<dyn PageDriver>,
}

/// Page targets known to one browser handle, turned into target events as
/// they appear, navigate and go away.
#[derive(Default)]
struct TargetTracker {
    known: Mutex<HashMap<String, TrackedTarget>>,
    events: EventHub,
}

impl TargetTracker {
    fn page_target(id: String, url: String, page: Option<Arc<dyn PageDriver>>) -> Target {
        Target {
            id,
            kind: TargetKind::Page,
            url,
            page,
        }
    }

    /// Tracks a page opened through this handle and returns the tracked
    /// handle, which is the watcher's own if it saw the tab first.
    fn opened(&self, page: Arc<dyn PageDriver>) -> Arc<dyn PageDriver> {
        let id = page.target_id();
        let mut known = self.known.lock();
        if let Some(tracked) = known.get(&id) {
            return tracked.page.clone();
        }
        let url = page.url();
        known.insert(
            id.clone(),
            TrackedTarget {
                url: url.clone(),
                page: page.clone(),
            },
        );
        self.events.emit(BrowserEvent::TargetCreated(Self::page_target(
            id,
            url,
            Some(page.clone()),
        )));
        page
    }

    fn closed(&self, id: &str) {
        let mut known = self.known.lock();
        if let Some(tracked) = known.remove(id) {
            self.events.emit(BrowserEvent::TargetDestroyed(Self::page_target(
                id.to_string(),
                tracked.url,
                None,
            )));
        }
    }

    fn tracked(&self, id: &str) -> Option<Arc<dyn PageDriver>> {
        self.known.lock().get(id).map(|tracked| tracked.page.clone())
    }

    /// Diffs the live page list against what is known.
    fn sync(&self, current: Vec<Arc<dyn PageDriver>>) {
        let mut known = self.known.lock();
        let mut live = HashSet::with_capacity(current.len());

        for page in current {
            let id = page.target_id();
            let url = page.url();
            live.insert(id.clone());
            match known.get_mut(&id) {
                Some(tracked) if tracked.url != url => {
                    tracked.url = url.clone();
                    let page = Some(tracked.page.clone());
                    self.events
                        .emit(BrowserEvent::TargetChanged(Self::page_target(id, url, page)));
                }
                Some(_) => {}
                None => {
                    known.insert(
                        id.clone(),
                        TrackedTarget {
                            url: url.clone(),
                            page: page.clone(),
                        },
                    );
                    self.events.emit(BrowserEvent::TargetCreated(Self::page_target(
                        id,
                        url,
                        Some(page),
                    )));
                }
            }
        }

        let gone: Vec<String> = known
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(tracked) = known.remove(&id) {
                self.events.emit(BrowserEvent::TargetDestroyed(Self::page_target(
                    id,
                    tracked.url,
                    None,
                )));
            }
        }
    }
}

async fn watch_targets(browser: Weak<Browser>, targets: Weak<TargetTracker>) {
    let mut ticks = tokio::time::interval(TARGET_POLL_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let (Some(chrome), Some(tracker)) = (browser.upgrade(), targets.upgrade()) else {
            break;
        };
        let tabs = match open_tabs(&chrome) {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!(error = %e, "Could not list tabs");
                continue;
            }
        };
        tracker.sync(
            tabs.into_iter()
                .map(|tab| chrome_page(tab, browser.clone(), targets.clone()))
                .collect(),
        );
    }
    debug!("Target watcher stopped");
}

/// A Chrome instance owned or attached through `headless_chrome`.
///
/// Target events come from the tab list, which a background task polls once
/// the first subscriber appears.
pub struct ChromeBrowser {
    browser: Mutex<Option<Arc<Browser>>>,
    launched: bool,
    targets: Arc<TargetTracker>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChromeBrowser {
    fn new(browser: Browser, launched: bool) -> Self {
        Self {
            browser: Mutex::new(Some(Arc::new(browser))),
            launched,
            targets: Arc::new(TargetTracker::default()),
            watcher: Mutex::new(None),
        }
    }

    fn browser(&self) -> Result<Arc<Browser>> {
        self.browser.lock().clone().ok_or(ExtraError::BrowserClosed)
    }

    fn page(&self, browser: &Arc<Browser>, tab: Arc<Tab>) -> Arc<dyn PageDriver> {
        chrome_page(tab, Arc::downgrade(browser), Arc::downgrade(&self.targets))
    }

    fn watch(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let Some(browser) = self.browser.lock().as_ref().map(Arc::downgrade) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let targets = Arc::downgrade(&self.targets);
                *watcher = Some(runtime.spawn(watch_targets(browser, targets)));
            }
            Err(_) => warn!("No tokio runtime, only pages opened through this handle are reported"),
        }
    }

    fn stop_watching(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

impl Drop for ChromeBrowser {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[async_trait]
impl BrowserDriver for ChromeBrowser {
    fn family(&self) -> BrowserFamily {
        BrowserFamily::Chromium
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrowserEvent> {
        let events = self.targets.events.subscribe();
        self.watch();
        events
    }

    async fn new_page(&self) -> Result<Arc<dyn PageDriver>> {
        let browser = self.browser()?;
        let tab = browser
            .new_tab()
            .map_err(|e| ExtraError::PageCreationFailed(e.to_string()))?;
        Ok(self.targets.opened(self.page(&browser, tab)))
    }

    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>> {
        let browser = self.browser()?;
        Ok(open_tabs(&browser)?
            .into_iter()
            .map(|tab| {
                self.targets
                    .tracked(tab.get_target_id())
                    .unwrap_or_else(|| self.page(&browser, tab))
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        let browser = self.browser.lock().take();
        if browser.is_none() {
            return Ok(());
        }
        self.stop_watching();
        // Dropping the last handle kills a launched process.
        drop(browser);
        self.targets.events.emit(BrowserEvent::Disconnected);
        if self.launched {
            self.targets.events.emit(BrowserEvent::ProcessExited);
        }
        debug!(launched = self.launched, "Chrome closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.browser.lock().is_some()
    }

    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>> {
        let session: Arc<dyn CdpSession> = Arc::new(ChromeCdpSession {
            browser: Arc::downgrade(&self.browser()?),
            tab: None,
        });
        Ok(Some(session))
    }

    async fn user_agent(&self) -> Result<String> {
        let version = self
            .browser()?
            .get_version()
            .map_err(ExtraError::from_any_error)?;
        Ok(version.user_agent)
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    browser: Weak<Browser>,
    targets: Weak<TargetTracker>,
}

#[async_trait]
impl PageDriver for ChromePage {
    fn target_id(&self) -> String {
        self.tab.get_target_id().to_string()
    }

    fn url(&self) -> String {
        self.tab.get_url()
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .map_err(ExtraError::from_any_error)?;
        self.tab
            .wait_until_navigated()
            .map_err(ExtraError::from_any_error)?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .tab
            .evaluate(expression, false)
            .map_err(ExtraError::from_any_error)?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    async fn close(&self) -> Result<()> {
        self.tab.close(false).map_err(ExtraError::from_any_error)?;
        if let Some(targets) = self.targets.upgrade() {
            targets.closed(&self.target_id());
        }
        Ok(())
    }

    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>> {
        let session: Arc<dyn CdpSession> = Arc::new(ChromeCdpSession {
            browser: self.browser.clone(),
            tab: Some(self.tab.clone()),
        });
        Ok(Some(session))
    }

    async fn set_user_agent(
        &self,
        user_agent: &str,
        accept_language: Option<&str>,
        platform: Option<&str>,
    ) -> Result<()> {
        self.tab
            .set_user_agent(user_agent, accept_language, platform)
            .map_err(ExtraError::from_any_error)?;
        Ok(())
    }
}

fn string_param<'a>(method: &str, params: &'a Value, key: &str) -> Result<&'a str> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| {
        ExtraError::InvalidOptions(format!("{} needs a string '{}'", method, key))
    })
}

fn optional_string_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn header_params<'a>(method: &str, params: &'a Value) -> Result<HashMap<&'a str, &'a str>> {
    let headers = params
        .get("headers")
        .and_then(Value::as_object)
        .ok_or_else(|| ExtraError::InvalidOptions(format!("{} needs a 'headers' object", method)))?;
    headers
        .iter()
        .map(|(name, value)| {
            value
                .as_str()
                .map(|value| (name.as_str(), value))
                .ok_or_else(|| {
                    ExtraError::InvalidOptions(format!("header '{}' is not a string", name))
                })
        })
        .collect()
}

/// A DevTools session over `headless_chrome`. Methods are mapped onto the
/// crate's typed calls; anything without a mapping is unsupported. Page
/// methods need a page session.
struct ChromeCdpSession {
    browser: Weak<Browser>,
    tab: Option<Arc<Tab>>,
}

impl ChromeCdpSession {
    fn browser(&self) -> Result<Arc<Browser>> {
        self.browser.upgrade().ok_or(ExtraError::BrowserClosed)
    }

    fn tab(&self, method: &str) -> Result<&Arc<Tab>> {
        self.tab
            .as_ref()
            .ok_or_else(|| ExtraError::unsupported("browser session", method))
    }
}

#[async_trait]
impl CdpSession for ChromeCdpSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Browser.getVersion" => {
                let version = self.browser()?.get_version().map_err(ExtraError::from_any_error)?;
                Ok(json!({
                    "protocolVersion": version.protocol_version,
                    "product": version.product,
                    "revision": version.revision,
                    "userAgent": version.user_agent,
                    "jsVersion": version.js_version,
                }))
            }
            "Target.getTargets" => {
                let infos: Vec<Value> = open_tabs(&*self.browser()?)?
                    .iter()
                    .map(|tab| {
                        json!({
                            "targetId": tab.get_target_id(),
                            "type": "page",
                            "url": tab.get_url(),
                        })
                    })
                    .collect();
                Ok(json!({ "targetInfos": infos }))
            }
            "Network.setUserAgentOverride" | "Emulation.setUserAgentOverride" => {
                let user_agent = string_param(method, &params, "userAgent")?;
                self.tab(method)?
                    .set_user_agent(
                        user_agent,
                        optional_string_param(&params, "acceptLanguage"),
                        optional_string_param(&params, "platform"),
                    )
                    .map_err(ExtraError::from_any_error)?;
                Ok(json!({}))
            }
            "Network.setExtraHTTPHeaders" => {
                let headers = header_params(method, &params)?;
                self.tab(method)?
                    .set_extra_http_headers(headers)
                    .map_err(ExtraError::from_any_error)?;
                Ok(json!({}))
            }
            "Runtime.evaluate" => {
                let expression = string_param(method, &params, "expression")?;
                let await_promise = params
                    .get("awaitPromise")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let result = self
                    .tab(method)?
                    .evaluate(expression, await_promise)
                    .map_err(ExtraError::from_any_error)?;
                Ok(json!({ "result": serde_json::to_value(result)? }))
            }
            "Page.navigate" => {
                let url = string_param(method, &params, "url")?;
                let tab = self.tab(method)?;
                tab.navigate_to(url).map_err(ExtraError::from_any_error)?;
                Ok(json!({ "frameId": tab.get_target_id() }))
            }
            "Page.reload" => {
                let ignore_cache = params
                    .get("ignoreCache")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.tab(method)?
                    .reload(ignore_cache, None)
                    .map_err(ExtraError::from_any_error)?;
                Ok(json!({}))
            }
            other => Err(ExtraError::unsupported(EngineKind::Cdp, other)),
        }
    }
}
