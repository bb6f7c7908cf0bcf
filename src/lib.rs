//! Plugin orchestration for browser automation engines.
//!
//! Plugins register with an [`Orchestrator`], which resolves their
//! dependencies, orders them and runs their lifecycle hooks around every
//! launch or connect. Engine handles reach plugins through a compatibility
//! shim so one plugin works against either engine.

pub mod browser;
pub mod core;
pub mod errors;
pub mod orchestrator;
pub mod plugins;
pub mod testing;
pub mod types;

pub use browser::{Browser, ShimBrowser, ShimPage};
pub use core::{Config, Engine, EngineKind, FailurePolicy};
pub use errors::{ExtraError, Result};
pub use orchestrator::Orchestrator;
pub use plugins::{Hook, HookSet, Plugin, PluginCatalog, PluginLoader};
pub use types::*;
