use crate::browser::ShimBrowser;
use crate::core::{BrowserEvent, FailurePolicy, SessionContext, Target};
use crate::errors::{ExtraError, Result};
use crate::plugins::{Hook, Plugin};
use crate::types::{Requirement, SessionKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Runs the launch/connect phases of one session across a plugin snapshot.
pub(crate) struct LifecycleDispatcher<'a> {
    plugins: &'a [Arc<dyn Plugin>],
    policy: FailurePolicy,
}

impl<'a> LifecycleDispatcher<'a> {
    pub(crate) fn new(plugins: &'a [Arc<dyn Plugin>], policy: FailurePolicy) -> Self {
        Self { plugins, policy }
    }

    fn declaring(&self, hook: Hook) -> impl Iterator<Item = &'a Arc<dyn Plugin>> {
        let plugins = self.plugins;
        plugins.iter().filter(move |p| p.hooks().contains(hook))
    }

    /// Threads the options through every `before_*` hook in order.
    pub(crate) async fn run_before(&self, context: &mut SessionContext) -> Result<()> {
        let hook = match context.kind {
            SessionKind::Launch => Hook::BeforeLaunch,
            SessionKind::Connect => Hook::BeforeConnect,
        };

        for plugin in self.declaring(hook) {
            debug!(plugin = %plugin.name(), hook = %hook, "Running hook");
            let result = match context.kind {
                SessionKind::Launch => plugin.before_launch(&context.options).await,
                SessionKind::Connect => plugin.before_connect(&context.options).await,
            };
            match result {
                Ok(Some(options)) if !options.is_null() => context.options = options,
                Ok(_) => {}
                Err(e) => self.handle(plugin, hook, e)?,
            }
        }
        Ok(())
    }

    /// Advisory only: warns about plugins that will not work in this session.
    pub(crate) fn check_requirements(&self, context: &SessionContext) {
        // Headless only matters for a browser we start ourselves.
        let headless = context.is_launch() && context.requests_headless();
        for plugin in self.plugins {
            let requirements = plugin.requirements();
            if headless && requirements.contains(Requirement::HeadfulOnly) {
                warn!(
                    plugin = %plugin.name(),
                    "Plugin is not supported in headless mode"
                );
            }
            if !context.is_launch() && requirements.contains(Requirement::LaunchOnly) {
                warn!(
                    plugin = %plugin.name(),
                    "Plugin only works with launched browsers, not connected ones"
                );
            }
        }
    }

    /// `after_launch`/`after_connect` then `on_browser`, per plugin in order.
    pub(crate) async fn run_after(
        &self,
        browser: &Arc<ShimBrowser>,
        context: &SessionContext,
    ) -> Result<()> {
        let after = match context.kind {
            SessionKind::Launch => Hook::AfterLaunch,
            SessionKind::Connect => Hook::AfterConnect,
        };

        for plugin in self.plugins {
            let hooks = plugin.hooks();
            if hooks.contains(after) {
                debug!(plugin = %plugin.name(), hook = %after, "Running hook");
                let result = match context.kind {
                    SessionKind::Launch => plugin.after_launch(browser, context).await,
                    SessionKind::Connect => plugin.after_connect(browser, context).await,
                };
                if let Err(e) = result {
                    self.handle(plugin, after, e)?;
                }
            }
            if hooks.contains(Hook::Browser) {
                debug!(plugin = %plugin.name(), hook = %Hook::Browser, "Running hook");
                if let Err(e) = plugin.on_browser(browser, context).await {
                    self.handle(plugin, Hook::Browser, e)?;
                }
            }
        }
        Ok(())
    }

    fn handle(&self, plugin: &Arc<dyn Plugin>, hook: Hook, err: anyhow::Error) -> Result<()> {
        match self.policy {
            FailurePolicy::AbortPhase => Err(ExtraError::Hook {
                plugin: plugin.name().to_string(),
                hook,
                source: err,
            }),
            FailurePolicy::Continue => {
                error!(plugin = %plugin.name(), hook = %hook, error = %err, "Hook failed, continuing");
                Ok(())
            }
        }
    }
}

fn log_event_error(plugin: &Arc<dyn Plugin>, hook: Hook, result: anyhow::Result<()>) {
    if let Err(e) = result {
        error!(plugin = %plugin.name(), hook = %hook, error = %e, "Event hook failed");
    }
}

async fn fan_out_target(plugins: &[Arc<dyn Plugin>], hook: Hook, target: &Target) {
    for plugin in plugins.iter().filter(|p| p.hooks().contains(hook)) {
        let result = match hook {
            Hook::TargetCreated => plugin.on_target_created(target).await,
            Hook::TargetChanged => plugin.on_target_changed(target).await,
            _ => plugin.on_target_destroyed(target).await,
        };
        log_event_error(plugin, hook, result);
    }
}

/// Fans one browser event out to the declaring plugins in order.
///
/// Page targets get a second pass through `on_page_created` with the page
/// wrapped for the browser's engine.
pub(crate) async fn dispatch_event(
    plugins: &[Arc<dyn Plugin>],
    browser: &ShimBrowser,
    event: &BrowserEvent,
) {
    match event {
        BrowserEvent::TargetCreated(target) => {
            fan_out_target(plugins, Hook::TargetCreated, target).await;
            let page = match &target.page {
                Some(page) if target.is_page() => page,
                _ => return,
            };
            let declaring: Vec<_> = plugins
                .iter()
                .filter(|p| p.hooks().contains(Hook::PageCreated))
                .collect();
            if declaring.is_empty() {
                return;
            }
            let page = browser.page(page);
            for plugin in declaring {
                let result = plugin.on_page_created(page.clone()).await;
                log_event_error(plugin, Hook::PageCreated, result);
            }
        }
        BrowserEvent::TargetChanged(target) => {
            fan_out_target(plugins, Hook::TargetChanged, target).await;
        }
        BrowserEvent::TargetDestroyed(target) => {
            fan_out_target(plugins, Hook::TargetDestroyed, target).await;
        }
        BrowserEvent::Disconnected => {
            for plugin in plugins.iter().filter(|p| p.hooks().contains(Hook::Disconnected)) {
                let result = plugin.on_disconnected().await;
                log_event_error(plugin, Hook::Disconnected, result);
            }
        }
        BrowserEvent::ProcessExited => {}
    }
}

/// Runs `on_close` across the plugins unless `fired` is already set.
pub(crate) async fn run_close_hooks(plugins: &[Arc<dyn Plugin>], fired: &AtomicBool) {
    if fired.swap(true, Ordering::SeqCst) {
        return;
    }
    for plugin in plugins.iter().filter(|p| p.hooks().contains(Hook::Close)) {
        let result = plugin.on_close().await;
        log_event_error(plugin, Hook::Close, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Engine, EngineKind};
    use crate::testing::{EventLog, LogCapture, MockEngine, TestPlugin};
    use serde_json::{json, Value};

    fn plugins(list: Vec<TestPlugin>) -> Vec<Arc<dyn Plugin>> {
        list.into_iter()
            .map(|p| Arc::new(p) as Arc<dyn Plugin>)
            .collect()
    }

    #[tokio::test]
    async fn waterfall_threads_options() {
        let log = EventLog::new();
        let first = TestPlugin::new("first").with_log(log.clone()).appends_arg("--flag-a");
        let second = Arc::new(TestPlugin::new("second").with_log(log.clone()).appends_arg("--flag-b"));
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(first), second.clone()];

        let mut context = SessionContext::new(SessionKind::Launch, json!({}));
        LifecycleDispatcher::new(&plugins, FailurePolicy::AbortPhase)
            .run_before(&mut context)
            .await
            .unwrap();

        assert_eq!(second.observed_options(), vec![json!({"args": ["--flag-a"]})]);
        assert_eq!(context.options, json!({"args": ["--flag-a", "--flag-b"]}));
    }

    #[tokio::test]
    async fn abort_phase_stops_at_first_failure() {
        let log = EventLog::new();
        let plugins = plugins(vec![
            TestPlugin::new("a").with_log(log.clone()).fails_in(Hook::BeforeLaunch),
            TestPlugin::new("b").with_log(log.clone()).hook(Hook::BeforeLaunch),
        ]);

        let mut context = SessionContext::new(SessionKind::Launch, json!({}));
        let err = LifecycleDispatcher::new(&plugins, FailurePolicy::AbortPhase)
            .run_before(&mut context)
            .await
            .unwrap_err();

        assert!(matches!(err, ExtraError::Hook { hook: Hook::BeforeLaunch, .. }));
        assert_eq!(err.plugin(), Some("a"));
        assert_eq!(log.entries(), vec!["a:before_launch"]);
    }

    #[tokio::test]
    async fn continue_policy_runs_every_plugin() {
        let log = EventLog::new();
        let plugins = plugins(vec![
            TestPlugin::new("a").with_log(log.clone()).fails_in(Hook::BeforeLaunch),
            TestPlugin::new("b").with_log(log.clone()).hook(Hook::BeforeLaunch),
        ]);

        let mut context = SessionContext::new(SessionKind::Launch, json!({}));
        LifecycleDispatcher::new(&plugins, FailurePolicy::Continue)
            .run_before(&mut context)
            .await
            .unwrap();

        assert_eq!(log.entries(), vec!["a:before_launch", "b:before_launch"]);
    }

    #[tokio::test]
    async fn after_hooks_run_per_plugin_before_the_next() {
        let log = EventLog::new();
        let plugins = plugins(vec![
            TestPlugin::new("a")
                .with_log(log.clone())
                .hook(Hook::AfterConnect)
                .hook(Hook::Browser),
            TestPlugin::new("b").with_log(log.clone()).hook(Hook::Browser),
        ]);

        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = ShimBrowser::wrap(engine.kind(), engine.connect(&json!({})).await.unwrap());
        let context = SessionContext::new(SessionKind::Connect, json!({}));
        LifecycleDispatcher::new(&plugins, FailurePolicy::AbortPhase)
            .run_after(&browser, &context)
            .await
            .unwrap();

        assert_eq!(
            log.entries(),
            vec!["a:after_connect", "a:on_browser", "b:on_browser"]
        );
    }

    #[tokio::test]
    async fn target_then_page_fan_out() {
        let log = EventLog::new();
        let plugins = plugins(vec![
            TestPlugin::new("a")
                .with_log(log.clone())
                .hook(Hook::TargetCreated)
                .hook(Hook::PageCreated),
            TestPlugin::new("b").with_log(log.clone()).hook(Hook::TargetCreated),
        ]);

        let engine = MockEngine::new(EngineKind::Cdp);
        let browser = ShimBrowser::wrap(engine.kind(), engine.launch(&json!({})).await.unwrap());
        let _ = browser.driver().new_page().await.unwrap();
        let page = browser.driver().pages().await.unwrap().remove(0);
        let target = Target {
            id: page.target_id(),
            kind: crate::core::TargetKind::Page,
            url: page.url(),
            page: Some(page),
        };

        dispatch_event(&plugins, &browser, &BrowserEvent::TargetCreated(target)).await;
        assert_eq!(
            log.entries(),
            vec!["a:on_target_created", "b:on_target_created", "a:on_page_created"]
        );
    }

    #[tokio::test]
    async fn close_hooks_fire_once() {
        let log = EventLog::new();
        let plugins = plugins(vec![TestPlugin::new("a").with_log(log.clone()).hook(Hook::Close)]);
        let fired = AtomicBool::new(false);

        run_close_hooks(&plugins, &fired).await;
        run_close_hooks(&plugins, &fired).await;
        assert_eq!(log.count("a:on_close"), 1);
    }

    fn requirement_warnings(kind: SessionKind, options: Value) -> String {
        let plugins = plugins(vec![
            TestPlugin::new("launcher").requires(Requirement::LaunchOnly),
            TestPlugin::new("headful").requires(Requirement::HeadfulOnly),
        ]);
        let context = SessionContext::new(kind, options);
        let logs = LogCapture::new();
        logs.scope(|| {
            LifecycleDispatcher::new(&plugins, FailurePolicy::AbortPhase)
                .check_requirements(&context)
        });
        logs.contents()
    }

    #[test]
    fn connect_warns_about_launch_only_plugins() {
        let logs = requirement_warnings(SessionKind::Connect, json!({"headless": true}));
        assert!(logs.contains("WARN"));
        assert!(logs.contains("plugin=launcher"));
        assert!(logs.contains("only works with launched browsers"));
        assert!(!logs.contains("plugin=headful"));
    }

    #[test]
    fn headless_launch_warns_about_headful_only_plugins() {
        let logs = requirement_warnings(SessionKind::Launch, json!({"headless": true}));
        assert!(logs.contains("plugin=headful"));
        assert!(logs.contains("not supported in headless mode"));
        assert!(!logs.contains("plugin=launcher"));
    }

    #[test]
    fn headful_launch_has_nothing_to_warn_about() {
        let logs = requirement_warnings(SessionKind::Launch, json!({"headless": false}));
        assert!(!logs.contains("WARN"), "unexpected warnings: {}", logs);
    }
}
