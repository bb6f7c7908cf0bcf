use crate::plugins::base::plugin_addr;
use crate::plugins::ordering::stable_partition;
use crate::plugins::{DataBus, Hook, Plugin};
use crate::types::Requirement;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) type PluginList = Arc<RwLock<Vec<Arc<dyn Plugin>>>>;

/// Ordered registry of plugins. Order is invocation order.
pub struct PluginRegistry {
    plugins: PluginList,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a plugin.
    ///
    /// Nameless plugins and name clashes are logged and ignored; registering
    /// the same instance again is a no-op. Returns whether the plugin was
    /// added.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> bool {
        let name = plugin.name().to_string();
        if name.trim().is_empty() {
            warn!("Ignoring plugin without a name");
            return false;
        }

        let wants_data = plugin
            .requirements()
            .contains(Requirement::WantsCrossPluginData);
        let hooks = plugin.hooks();

        {
            let mut plugins = self.plugins.write();
            let addr = plugin_addr(&plugin);
            if plugins.iter().any(|p| plugin_addr(p) == addr) {
                debug!(plugin = %name, "Plugin instance already registered");
                return false;
            }
            if plugins.iter().any(|p| p.name() == name) {
                warn!(plugin = %name, "Ignoring plugin: a different plugin with this name is already registered");
                return false;
            }
            plugins.push(plugin.clone());
        }

        if wants_data {
            plugin.attach_data_bus(self.data_bus());
        }

        debug!(plugin = %name, hooks = ?hooks, "Plugin registered");

        if hooks.contains(Hook::PluginRegistered) {
            plugin.on_plugin_registered();
        }
        true
    }

    /// Snapshot of the registered plugins in order.
    pub fn list(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().iter().find(|p| p.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().iter().any(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// A query handle over this registry's published data.
    pub fn data_bus(&self) -> DataBus {
        DataBus::new(Arc::downgrade(&self.plugins))
    }

    /// Move every `RunLast` plugin behind the others, keeping relative order
    /// within both groups.
    pub fn order_run_last(&self) {
        // Requirements are read outside the write lock.
        let run_last: HashSet<usize> = self
            .list()
            .iter()
            .filter(|p| p.requirements().contains(Requirement::RunLast))
            .map(plugin_addr)
            .collect();
        if run_last.is_empty() {
            return;
        }

        let mut plugins = self.plugins.write();
        let current = std::mem::take(&mut *plugins);
        *plugins = stable_partition(current, |p| run_last.contains(&plugin_addr(p)));
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
