//! Small plugins shipped with the crate.

pub mod launch_args;
pub mod user_agent;

pub use launch_args::LaunchArgs;
pub use user_agent::UserAgentOverride;

use crate::plugins::PluginCatalog;
use std::sync::Arc;

/// A catalog that can auto-load the bundled plugins by name.
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(launch_args::NAME, |options| {
            Ok(Arc::new(LaunchArgs::new(options.clone())))
        })
        .with(user_agent::NAME, |options| {
            Ok(Arc::new(UserAgentOverride::new(options.clone())?))
        })
}
