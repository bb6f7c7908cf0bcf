use crate::browser::{ShimBrowser, ShimPage};
use crate::core::{SessionContext, Target};
use crate::plugins::DataBus;
use crate::types::{DataRecord, Dependency, Requirements};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

static NO_OPTIONS: Value = Value::Null;

/// Lifecycle hooks a plugin can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PluginRegistered,
    BeforeLaunch,
    AfterLaunch,
    BeforeConnect,
    AfterConnect,
    Browser,
    TargetCreated,
    PageCreated,
    TargetChanged,
    TargetDestroyed,
    Disconnected,
    Close,
}

impl Hook {
    pub const ALL: [Hook; 12] = [
        Hook::PluginRegistered,
        Hook::BeforeLaunch,
        Hook::AfterLaunch,
        Hook::BeforeConnect,
        Hook::AfterConnect,
        Hook::Browser,
        Hook::TargetCreated,
        Hook::PageCreated,
        Hook::TargetChanged,
        Hook::TargetDestroyed,
        Hook::Disconnected,
        Hook::Close,
    ];

    /// Hooks that are driven by browser events rather than by the
    /// launch/connect call itself.
    pub const EVENT_DRIVEN: [Hook; 5] = [
        Hook::TargetCreated,
        Hook::PageCreated,
        Hook::TargetChanged,
        Hook::TargetDestroyed,
        Hook::Disconnected,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Hook::PluginRegistered => "on_plugin_registered",
            Hook::BeforeLaunch => "before_launch",
            Hook::AfterLaunch => "after_launch",
            Hook::BeforeConnect => "before_connect",
            Hook::AfterConnect => "after_connect",
            Hook::Browser => "on_browser",
            Hook::TargetCreated => "on_target_created",
            Hook::PageCreated => "on_page_created",
            Hook::TargetChanged => "on_target_changed",
            Hook::TargetDestroyed => "on_target_destroyed",
            Hook::Disconnected => "on_disconnected",
            Hook::Close => "on_close",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of hooks a plugin implements.
///
/// The dispatcher only calls, and only subscribes to engine events for,
/// hooks that appear here.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet(u16);

impl HookSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(self, hook: Hook) -> Self {
        Self(self.0 | hook.bit())
    }

    pub fn contains(&self, hook: Hook) -> bool {
        self.0 & hook.bit() != 0
    }

    pub fn contains_any(&self, hooks: &[Hook]) -> bool {
        hooks.iter().any(|hook| self.contains(*hook))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Hook> {
        let set = *self;
        Hook::ALL.into_iter().filter(move |hook| set.contains(*hook))
    }
}

impl FromIterator<Hook> for HookSet {
    fn from_iter<I: IntoIterator<Item = Hook>>(iter: I) -> Self {
        iter.into_iter().fold(HookSet::empty(), HookSet::with)
    }
}

impl<const N: usize> From<[Hook; N]> for HookSet {
    fn from(hooks: [Hook; N]) -> Self {
        hooks.into_iter().collect()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Base trait for all plugins.
///
/// Only `name` is required. Every hook has a no-op default, and a hook is
/// only ever invoked when it is listed in [`Plugin::hooks`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// Declared default options, before user overrides.
    fn defaults(&self) -> Value {
        Value::Null
    }

    /// Options after merging overrides into [`Plugin::defaults`].
    fn options(&self) -> &Value {
        &NO_OPTIONS
    }

    fn requirements(&self) -> Requirements {
        Requirements::new()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Records published on the data bus. Read on every query.
    fn data(&self) -> Vec<DataRecord> {
        Vec::new()
    }

    fn hooks(&self) -> HookSet {
        HookSet::empty()
    }

    /// Called at registration for plugins requiring `WantsCrossPluginData`.
    fn attach_data_bus(&self, _bus: DataBus) {}

    fn on_plugin_registered(&self) {}

    /// Waterfall hook. `Some(options)` replaces the options seen by later
    /// plugins and by the engine.
    async fn before_launch(&self, _options: &Value) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    async fn after_launch(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Waterfall hook, see [`Plugin::before_launch`].
    async fn before_connect(&self, _options: &Value) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    async fn after_connect(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after `after_launch`/`after_connect` for both entry points.
    async fn on_browser(
        &self,
        _browser: &Arc<ShimBrowser>,
        _context: &SessionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_target_created(&self, _target: &Target) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_page_created(&self, _page: Arc<ShimPage>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_target_changed(&self, _target: &Target) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_target_destroyed(&self, _target: &Target) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disconnected(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// May run more than once for the same plugin across browser handles.
    async fn on_close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pointer identity of a plugin instance, ignoring vtables.
pub(crate) fn plugin_addr(plugin: &Arc<dyn Plugin>) -> usize {
    Arc::as_ptr(plugin) as *const () as usize
}
