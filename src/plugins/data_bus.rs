use crate::plugins::Plugin;
use crate::types::DataRecord;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// Read access to the data every registered plugin publishes.
///
/// Handed to plugins that declare `WantsCrossPluginData`. Holds the
/// registry weakly; once the registry is gone every query is empty.
#[derive(Clone)]
pub struct DataBus {
    plugins: Weak<RwLock<Vec<Arc<dyn Plugin>>>>,
}

impl DataBus {
    pub(crate) fn new(plugins: Weak<RwLock<Vec<Arc<dyn Plugin>>>>) -> Self {
        Self { plugins }
    }

    /// All published records in registry order, optionally filtered by name.
    pub fn query(&self, name: Option<&str>) -> Vec<DataRecord> {
        let Some(plugins) = self.plugins.upgrade() else {
            return Vec::new();
        };
        // Release the lock before running plugin code.
        let snapshot = plugins.read().clone();
        collect_records(&snapshot, name)
    }

    /// Values of every record with the given name.
    pub fn values(&self, name: &str) -> Vec<serde_json::Value> {
        self.query(Some(name)).into_iter().map(|r| r.value).collect()
    }
}

impl fmt::Debug for DataBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBus")
            .field("attached", &(self.plugins.strong_count() > 0))
            .finish()
    }
}

pub(crate) fn collect_records(plugins: &[Arc<dyn Plugin>], name: Option<&str>) -> Vec<DataRecord> {
    plugins
        .iter()
        .flat_map(|plugin| plugin.data())
        .filter(|record| name.map_or(true, |wanted| record.name == wanted))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::plugins::PluginRegistry;
    use crate::testing::TestPlugin;
    use crate::types::Requirement;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn records_with_same_name_come_back_in_registry_order() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").publishes("foo", 1)));
        registry.register(Arc::new(TestPlugin::new("b").publishes("bar", true)));
        registry.register(Arc::new(TestPlugin::new("c").publishes("foo", 2)));

        let bus = registry.data_bus();
        assert_eq!(bus.values("foo"), vec![json!(1), json!(2)]);
        assert!(bus.query(Some("missing")).is_empty());
        assert_eq!(bus.query(None).len(), 3);
    }

    #[test]
    fn only_declaring_plugins_get_a_handle() {
        let registry = PluginRegistry::new();
        let consumer = Arc::new(TestPlugin::new("consumer").requires(Requirement::WantsCrossPluginData));
        let other = Arc::new(TestPlugin::new("other").publishes("foo", "bar"));
        registry.register(consumer.clone());
        registry.register(other.clone());

        assert!(other.data_bus().is_none());
        let bus = consumer.data_bus().expect("bus attached at registration");
        assert_eq!(bus.values("foo"), vec![json!("bar")]);
    }

    #[test]
    fn queries_reflect_current_state() {
        let registry = PluginRegistry::new();
        let publisher = Arc::new(TestPlugin::new("a"));
        registry.register(publisher.clone());
        let bus = registry.data_bus();
        assert!(bus.query(Some("late")).is_empty());

        publisher.publish_now("late", "value");
        assert_eq!(bus.values("late"), vec![json!("value")]);
    }

    #[test]
    fn handle_outliving_registry_is_empty() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").publishes("foo", 1)));
        let bus = registry.data_bus();
        drop(registry);
        assert!(bus.query(None).is_empty());
    }
}
