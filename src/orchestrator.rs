use crate::browser::dispatcher::LifecycleDispatcher;
use crate::browser::{Browser, ShimBrowser};
use crate::core::{Config, Engine, EngineKind, SessionContext};
use crate::errors::{ExtraError, Result};
use crate::plugins::{resolve_dependencies, Plugin, PluginLoader, PluginRegistry};
use crate::types::{DataRecord, SessionKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};

/// Owns a plugin registry and drives one engine through the plugin
/// lifecycle.
///
/// ```no_run
/// # async fn demo(engine: std::sync::Arc<dyn browser_extra::core::Engine>) -> browser_extra::errors::Result<()> {
/// use browser_extra::plugins::builtin::LaunchArgs;
/// use browser_extra::Orchestrator;
/// use std::sync::Arc;
///
/// let orchestrator = Orchestrator::new(engine);
/// orchestrator.use_plugin(Arc::new(LaunchArgs::with_args(["--mute-audio"])));
/// let browser = orchestrator.launch(serde_json::json!({"headless": true})).await?;
/// let page = browser.new_page().await?;
/// page.goto("https://example.com").await?;
/// browser.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    engine: Arc<dyn Engine>,
    registry: PluginRegistry,
    loader: Option<Arc<dyn PluginLoader>>,
    config: Config,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            registry: PluginRegistry::new(),
            loader: None,
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Loader used to auto-register missing dependencies.
    pub fn with_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Register a plugin. Invalid or clashing plugins are logged and skipped.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> &Self {
        self.registry.register(plugin);
        self
    }

    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.registry.list()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.registry.get(name)
    }

    /// Records published by every plugin, optionally filtered by name.
    pub fn plugin_data(&self, name: Option<&str>) -> Vec<DataRecord> {
        self.registry.data_bus().query(name)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Auto-register missing dependencies. Returns the names loaded.
    pub fn resolve_dependencies(&self) -> Result<Vec<String>> {
        resolve_dependencies(&self.registry, self.loader.as_deref())
    }

    /// Apply placement constraints to the registry.
    pub fn order_plugins(&self) {
        self.registry.order_run_last();
    }

    pub async fn launch(&self, options: Value) -> Result<Browser> {
        self.start(SessionKind::Launch, options).await
    }

    pub async fn connect(&self, options: Value) -> Result<Browser> {
        self.start(SessionKind::Connect, options).await
    }

    async fn start(&self, kind: SessionKind, options: Value) -> Result<Browser> {
        if !(options.is_object() || options.is_null()) {
            return Err(ExtraError::InvalidOptions(format!(
                "{} options must be an object",
                kind
            )));
        }
        let context = SessionContext::new(kind, options);
        let span = info_span!("session", id = %context.id, kind = %kind, engine = %self.engine.kind());
        self.run(context).instrument(span).await
    }

    async fn run(&self, mut context: SessionContext) -> Result<Browser> {
        let loaded = self.resolve_dependencies()?;
        if !loaded.is_empty() {
            info!(plugins = ?loaded, "Loaded plugin dependencies");
        }
        self.order_plugins();

        let plugins = self.registry.list();
        debug!(plugins = ?self.registry.names(), "Dispatch order");
        let dispatcher = LifecycleDispatcher::new(&plugins, self.config.failure_policy);

        dispatcher.run_before(&mut context).await?;
        if self.config.check_requirements {
            dispatcher.check_requirements(&context);
        }

        let driver = match context.kind {
            SessionKind::Launch => self.engine.launch(&context.options).await?,
            SessionKind::Connect => self.engine.connect(&context.options).await?,
        };
        let shim = ShimBrowser::wrap(self.engine.kind(), driver);
        let browser = Browser::bind(shim.clone(), context, &plugins, &self.config);

        dispatcher.run_after(&shim, browser.context()).await?;
        info!(plugins = plugins.len(), "Browser ready");
        Ok(browser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Hook;
    use crate::testing::{EventLog, MockEngine, TestPlugin};
    use serde_json::json;

    #[tokio::test]
    async fn launch_runs_phases_in_order() {
        let log = EventLog::new();
        let engine = Arc::new(MockEngine::new(EngineKind::Cdp));
        let orchestrator = Orchestrator::new(engine.clone())
            .with_config(Config::default().with_exit_signals(false));
        orchestrator.use_plugin(Arc::new(
            TestPlugin::new("a")
                .with_log(log.clone())
                .appends_arg("--flag-a")
                .hook(Hook::AfterLaunch)
                .hook(Hook::Browser),
        ));

        let browser = orchestrator.launch(json!({"headless": true})).await.unwrap();
        assert_eq!(
            log.entries(),
            vec!["a:before_launch", "a:after_launch", "a:on_browser"]
        );
        assert_eq!(
            engine.launched_options(),
            vec![json!({"headless": true, "args": ["--flag-a"]})]
        );
        assert_eq!(browser.options()["args"], json!(["--flag-a"]));
        assert_eq!(browser.kind(), EngineKind::Cdp);
    }

    #[tokio::test]
    async fn non_object_options_are_rejected() {
        let orchestrator = Orchestrator::new(Arc::new(MockEngine::new(EngineKind::Cdp)));
        let err = orchestrator.launch(json!("headless")).await.unwrap_err();
        assert!(matches!(err, ExtraError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn engine_failure_surfaces() {
        let orchestrator = Orchestrator::new(Arc::new(MockEngine::new(EngineKind::Cdp).failing()));
        let err = orchestrator.connect(json!({})).await.unwrap_err();
        assert!(matches!(err, ExtraError::ConnectFailed(_)));
    }
}
