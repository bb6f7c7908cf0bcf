use crate::errors::{ExtraError, Result};
use crate::plugins::{Plugin, PluginRegistry};
use crate::types::Dependency;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Produces a plugin instance for a dependency name.
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str, options: &Value) -> anyhow::Result<Arc<dyn Plugin>>;
}

impl<F> PluginLoader for F
where
    F: Fn(&str, &Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync,
{
    fn load(&self, name: &str, options: &Value) -> anyhow::Result<Arc<dyn Plugin>> {
        self(name, options)
    }
}

type PluginFactory = Box<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// In-process loader: plugin factories keyed by plugin name.
#[derive(Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PluginLoader for PluginCatalog {
    fn load(&self, name: &str, options: &Value) -> anyhow::Result<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no plugin named '{}' in catalog", name))?;
        factory(options)
    }
}

/// Auto-registers every missing transitive dependency of the registry.
///
/// Returns the names that were loaded, in load order.
pub fn resolve_dependencies(
    registry: &PluginRegistry,
    loader: Option<&dyn PluginLoader>,
) -> Result<Vec<String>> {
    let mut resolver = DependencyResolver {
        registry,
        loader,
        in_progress: HashSet::new(),
        loaded: Vec::new(),
    };
    resolver.run()?;
    Ok(resolver.loaded)
}

struct DependencyResolver<'a> {
    registry: &'a PluginRegistry,
    loader: Option<&'a dyn PluginLoader>,
    in_progress: HashSet<String>,
    loaded: Vec<String>,
}

impl DependencyResolver<'_> {
    fn run(&mut self) -> Result<()> {
        loop {
            let missing = self.missing();
            if missing.is_empty() {
                return Ok(());
            }
            debug!(missing = ?missing.iter().map(|(d, _)| &d.name).collect::<Vec<_>>(), "Resolving plugin dependencies");
            for (dependency, required_by) in missing {
                self.resolve(dependency, &required_by)?;
            }
        }
    }

    /// Missing dependencies in first-declaration order, with the name of the
    /// first plugin declaring each.
    fn missing(&self) -> Vec<(Dependency, String)> {
        let plugins = self.registry.list();
        let registered: HashSet<&str> = plugins.iter().map(|p| p.name()).collect();
        let mut seen = HashSet::new();
        let mut missing = Vec::new();

        for plugin in &plugins {
            for dependency in plugin.dependencies() {
                if registered.contains(dependency.name.as_str()) {
                    continue;
                }
                if seen.insert(dependency.name.clone()) {
                    missing.push((dependency, plugin.name().to_string()));
                }
            }
        }
        missing
    }

    fn resolve(&mut self, dependency: Dependency, required_by: &str) -> Result<()> {
        let name = dependency.name;
        // Two plugins sharing a dependency: the first resolution wins.
        if self.registry.contains(&name) {
            return Ok(());
        }
        if self.in_progress.contains(&name) {
            debug!(plugin = %name, "Dependency is already being resolved");
            return Ok(());
        }

        let loader = self.loader.ok_or_else(|| ExtraError::MissingDependency {
            name: name.clone(),
            required_by: required_by.to_string(),
        })?;

        self.in_progress.insert(name.clone());
        let plugin = loader
            .load(&name, &dependency.options)
            .map_err(|source| ExtraError::DependencyLoad {
                name: name.clone(),
                source,
            })?;

        if plugin.name() != name {
            return Err(ExtraError::DependencyMismatch {
                requested: name,
                reason: format!("loader returned plugin '{}'", plugin.name()),
            });
        }
        if !self.registry.register(plugin.clone()) {
            return Err(ExtraError::DependencyMismatch {
                requested: name,
                reason: "registry rejected the loaded plugin".to_string(),
            });
        }
        info!(plugin = %name, required_by = %required_by, "Registered plugin dependency");
        self.loaded.push(name.clone());

        for nested in plugin.dependencies() {
            self.resolve(nested, &name)?;
        }
        self.in_progress.remove(&name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlugin;
    use parking_lot::Mutex;
    use serde_json::json;

    fn chain_catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with("b", |_| Ok(Arc::new(TestPlugin::new("b").depends_on("c"))))
            .with("c", |_| Ok(Arc::new(TestPlugin::new("c"))))
    }

    #[test]
    fn transitive_dependencies_are_loaded_once() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").depends_on("b")));

        let loaded = resolve_dependencies(&registry, Some(&chain_catalog())).unwrap();
        assert_eq!(loaded, vec!["b", "c"]);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);

        let again = resolve_dependencies(&registry, Some(&chain_catalog())).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn shared_dependency_loaded_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let loader = move |name: &str, _: &Value| -> anyhow::Result<Arc<dyn Plugin>> {
            recorded.lock().push(name.to_string());
            Ok(Arc::new(TestPlugin::new(name)))
        };

        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("x").depends_on("shared")));
        registry.register(Arc::new(TestPlugin::new("y").depends_on("shared")));

        resolve_dependencies(&registry, Some(&loader)).unwrap();
        assert_eq!(*calls.lock(), vec!["shared"]);
    }

    #[test]
    fn mutual_dependencies_terminate() {
        let catalog = PluginCatalog::new()
            .with("left", |_| Ok(Arc::new(TestPlugin::new("left").depends_on("right"))))
            .with("right", |_| Ok(Arc::new(TestPlugin::new("right").depends_on("left"))));

        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("root").depends_on("left")));

        let loaded = resolve_dependencies(&registry, Some(&catalog)).unwrap();
        assert_eq!(loaded, vec!["left", "right"]);
        assert_eq!(registry.names(), vec!["root", "left", "right"]);
    }

    #[test]
    fn missing_loader_is_fatal() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").depends_on("b")));

        let err = resolve_dependencies(&registry, None).unwrap_err();
        assert!(matches!(
            err,
            ExtraError::MissingDependency { ref name, ref required_by } if name == "b" && required_by == "a"
        ));
    }

    #[test]
    fn loader_failure_is_fatal() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").depends_on("nowhere")));

        let err = resolve_dependencies(&registry, Some(&PluginCatalog::new())).unwrap_err();
        assert!(matches!(err, ExtraError::DependencyLoad { ref name, .. } if name == "nowhere"));
    }

    #[test]
    fn renamed_plugin_does_not_loop() {
        let loader = |_: &str, _: &Value| -> anyhow::Result<Arc<dyn Plugin>> {
            Ok(Arc::new(TestPlugin::new("something-else")))
        };
        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").depends_on("wanted")));

        let err = resolve_dependencies(&registry, Some(&loader)).unwrap_err();
        assert!(matches!(err, ExtraError::DependencyMismatch { .. }));
    }

    #[test]
    fn dependency_options_reach_the_loader() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let recorded = seen.clone();
        let loader = move |name: &str, options: &Value| -> anyhow::Result<Arc<dyn Plugin>> {
            *recorded.lock() = options.clone();
            Ok(Arc::new(TestPlugin::new(name)))
        };

        let registry = PluginRegistry::new();
        registry.register(Arc::new(TestPlugin::new("a").depends_on(
            Dependency::new("proxy").with_options(json!({"port": 3128})),
        )));

        resolve_dependencies(&registry, Some(&loader)).unwrap();
        assert_eq!(*seen.lock(), json!({"port": 3128}));
    }
}
