//! Uniform surface over browser and page handles from either engine.
//!
//! Every handle is tagged with the [`EngineKind`] that produced it when it is
//! wrapped. Members one engine lacks are synthesized over a lazily created,
//! cached DevTools session; when no session can be attached the synthesized
//! members degrade to logged no-ops.

use crate::core::{BrowserDriver, BrowserFamily, CdpSession, EngineKind, PageDriver};
use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::warn;

/// Stand-in session for handles that cannot attach one.
pub struct NoopCdpSession {
    owner: String,
}

impl NoopCdpSession {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }
}

#[async_trait]
impl CdpSession for NoopCdpSession {
    async fn send(&self, method: &str, _params: Value) -> Result<Value> {
        warn!(owner = %self.owner, method = %method, "DevTools session unavailable, ignoring call");
        Ok(Value::Null)
    }
}

async fn open_session<F>(owner: String, open: F) -> Arc<dyn CdpSession>
where
    F: std::future::Future<Output = Result<Option<Arc<dyn CdpSession>>>>,
{
    match open.await {
        Ok(Some(session)) => session,
        Ok(None) => Arc::new(NoopCdpSession::new(owner)),
        Err(e) => {
            warn!(owner = %owner, error = %e, "Failed to open DevTools session");
            Arc::new(NoopCdpSession::new(owner))
        }
    }
}

/// A page handle tagged with its engine.
pub struct ShimPage {
    engine: EngineKind,
    driver: Arc<dyn PageDriver>,
    session: OnceCell<Arc<dyn CdpSession>>,
}

impl ShimPage {
    fn new(engine: EngineKind, driver: Arc<dyn PageDriver>) -> Self {
        Self {
            engine,
            driver,
            session: OnceCell::new(),
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn driver(&self) -> &Arc<dyn PageDriver> {
        &self.driver
    }

    pub fn target_id(&self) -> String {
        self.driver.target_id()
    }

    /// The page's DevTools session, created on first use and cached.
    pub async fn cdp_session(&self) -> Arc<dyn CdpSession> {
        self.session
            .get_or_init(|| {
                open_session(
                    format!("page {}", self.driver.target_id()),
                    self.driver.create_cdp_session(),
                )
            })
            .await
            .clone()
    }

    pub async fn set_user_agent(
        &self,
        user_agent: &str,
        accept_language: Option<&str>,
        platform: Option<&str>,
    ) -> Result<()> {
        match self.engine {
            EngineKind::Cdp => {
                self.driver
                    .set_user_agent(user_agent, accept_language, platform)
                    .await
            }
            EngineKind::Playwright => {
                let mut params = Map::new();
                params.insert("userAgent".to_string(), json!(user_agent));
                if let Some(language) = accept_language {
                    params.insert("acceptLanguage".to_string(), json!(language));
                }
                if let Some(platform) = platform {
                    params.insert("platform".to_string(), json!(platform));
                }
                self.cdp_session()
                    .await
                    .send("Network.setUserAgentOverride", Value::Object(params))
                    .await?;
                Ok(())
            }
        }
    }

    /// The user agent the page currently reports.
    pub async fn user_agent(&self) -> Result<String> {
        let value = self.driver.evaluate("navigator.userAgent").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

impl Deref for ShimPage {
    type Target = dyn PageDriver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}

struct CacheEntry {
    source: Weak<dyn PageDriver>,
    shim: Weak<ShimPage>,
}

/// Weak cache of page shims keyed by source handle.
///
/// Holds neither the page nor its shim alive; wrapping the same page while
/// its shim is alive returns that shim.
#[derive(Default)]
pub struct ShimCache {
    entries: Mutex<HashMap<usize, CacheEntry>>,
}

impl ShimCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(&self, engine: EngineKind, page: &Arc<dyn PageDriver>) -> Arc<ShimPage> {
        let key = Arc::as_ptr(page) as *const () as usize;
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.source.strong_count() > 0 && entry.shim.strong_count() > 0);

        if let Some(entry) = entries.get(&key) {
            if let (Some(source), Some(shim)) = (entry.source.upgrade(), entry.shim.upgrade()) {
                if Arc::as_ptr(&source) as *const () as usize == key && shim.engine == engine {
                    return shim;
                }
            }
        }

        let shim = Arc::new(ShimPage::new(engine, page.clone()));
        entries.insert(
            key,
            CacheEntry {
                source: Arc::downgrade(page),
                shim: Arc::downgrade(&shim),
            },
        );
        shim
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.shim.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A browser handle tagged with its engine.
pub struct ShimBrowser {
    engine: EngineKind,
    driver: Arc<dyn BrowserDriver>,
    session: OnceCell<Arc<dyn CdpSession>>,
    pages: ShimCache,
}

impl ShimBrowser {
    pub fn wrap(engine: EngineKind, driver: Arc<dyn BrowserDriver>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            driver,
            session: OnceCell::new(),
            pages: ShimCache::new(),
        })
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn family(&self) -> BrowserFamily {
        self.driver.family()
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    /// Wrap a page that belongs to this browser.
    pub fn page(&self, page: &Arc<dyn PageDriver>) -> Arc<ShimPage> {
        self.pages.wrap(self.engine, page)
    }

    pub async fn pages(&self) -> Result<Vec<Arc<ShimPage>>> {
        let pages = self.driver.pages().await?;
        Ok(pages.iter().map(|page| self.page(page)).collect())
    }

    /// The browser-level DevTools session, created on first use and cached.
    pub async fn cdp_session(&self) -> Arc<dyn CdpSession> {
        self.session
            .get_or_init(|| {
                open_session(
                    format!("browser {}", self.driver.family_label()),
                    self.driver.create_cdp_session(),
                )
            })
            .await
            .clone()
    }

    pub async fn user_agent(&self) -> Result<String> {
        match self.engine {
            EngineKind::Cdp => self.driver.user_agent().await,
            EngineKind::Playwright => {
                let version = self
                    .cdp_session()
                    .await
                    .send("Browser.getVersion", json!({}))
                    .await?;
                Ok(version
                    .get("userAgent")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string())
            }
        }
    }
}

impl Deref for ShimBrowser {
    type Target = dyn BrowserDriver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}
