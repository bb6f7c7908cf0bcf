use crate::errors::{ExtraError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The automation engine family that produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Drives Chromium directly over the DevTools protocol. Debugging
    /// sessions and user-agent calls are native.
    Cdp,
    /// Multi-browser engine. Debugging sessions only exist on Chromium and
    /// user-agent calls must be synthesized.
    Playwright,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Cdp => write!(f, "cdp"),
            EngineKind::Playwright => write!(f, "playwright"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chromium,
    Firefox,
    Webkit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Page,
    BackgroundPage,
    ServiceWorker,
    SharedWorker,
    Browser,
    Other,
}

/// A debuggable target reported by the engine.
#[derive(Clone)]
pub struct Target {
    pub id: String,
    pub kind: TargetKind,
    pub url: String,
    /// Present for page targets.
    pub page: Option<Arc<dyn PageDriver>>,
}

impl Target {
    pub fn is_page(&self) -> bool {
        self.kind == TargetKind::Page && self.page.is_some()
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("has_page", &self.page.is_some())
            .finish()
    }
}

/// Events emitted by a browser handle.
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    TargetCreated(Target),
    TargetChanged(Target),
    TargetDestroyed(Target),
    Disconnected,
    /// The launched browser process exited.
    ProcessExited,
}

/// Entry point of an automation engine.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Start a new browser process from a JSON options bag.
    async fn launch(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>>;

    /// Attach to an already running browser.
    async fn connect(&self, options: &Value) -> Result<Arc<dyn BrowserDriver>>;
}

/// A browser handle as produced by an engine.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn family(&self) -> BrowserFamily;

    /// Subscribe to this browser's events. Each call returns an independent
    /// receiver that sees every event emitted after the call; none are
    /// dropped however slowly the receiver drains.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrowserEvent>;

    async fn new_page(&self) -> Result<Arc<dyn PageDriver>>;

    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Open a browser-level debugging session. `Ok(None)` means the browser
    /// cannot provide one.
    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>>;

    /// Native user agent lookup; only the primary engine has one.
    async fn user_agent(&self) -> Result<String> {
        Err(ExtraError::unsupported(self.family_label(), "Browser.userAgent"))
    }

    fn family_label(&self) -> String {
        format!("{:?}", self.family()).to_lowercase()
    }
}

/// A page handle as produced by an engine.
#[async_trait]
pub trait PageDriver: Send + Sync {
    fn target_id(&self) -> String;

    fn url(&self) -> String;

    async fn goto(&self, url: &str) -> Result<()>;

    async fn evaluate(&self, expression: &str) -> Result<Value>;

    async fn close(&self) -> Result<()>;

    /// Open a page-level debugging session. `Ok(None)` means the page
    /// cannot provide one.
    async fn create_cdp_session(&self) -> Result<Option<Arc<dyn CdpSession>>>;

    /// Native user agent override; only the primary engine has one.
    async fn set_user_agent(
        &self,
        _user_agent: &str,
        _accept_language: Option<&str>,
        _platform: Option<&str>,
    ) -> Result<()> {
        Err(ExtraError::unsupported("page", "Page.setUserAgent"))
    }
}

/// A low-level DevTools protocol session.
#[async_trait]
pub trait CdpSession: Send + Sync {
    async fn send(&self, method: &str, params: Value) -> Result<Value>;

    async fn detach(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_page_targets_with_handles_are_pages() {
        let target = Target {
            id: "t1".to_string(),
            kind: TargetKind::Page,
            url: "about:blank".to_string(),
            page: None,
        };
        assert!(!target.is_page());

        let worker = Target {
            kind: TargetKind::ServiceWorker,
            ..target
        };
        assert!(!worker.is_page());
    }

    #[test]
    fn engine_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(EngineKind::Playwright).unwrap(),
            Value::String("playwright".to_string())
        );
        assert_eq!(EngineKind::Cdp.to_string(), "cdp");
    }
}
