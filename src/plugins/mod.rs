pub mod base;
pub mod builtin;
pub mod data_bus;
pub mod options;
pub mod ordering;
pub mod registry;
pub mod resolver;

pub use base::{Hook, HookSet, Plugin};
pub use data_bus::DataBus;
pub use options::{deep_merge, PluginOptions};
pub use registry::PluginRegistry;
pub use resolver::{resolve_dependencies, PluginCatalog, PluginLoader};
