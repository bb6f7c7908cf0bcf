use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Capability flags a plugin can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Requirement {
    /// Only meaningful for sessions the orchestrator launched itself.
    LaunchOnly,
    /// Does not work against a headless browser.
    HeadfulOnly,
    /// Receives a [`crate::plugins::DataBus`] handle at registration.
    WantsCrossPluginData,
    /// Moved behind every other plugin before dispatch.
    RunLast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements(BTreeSet<Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.0.insert(requirement);
        self
    }

    pub fn contains(&self, requirement: Requirement) -> bool {
        self.0.contains(&requirement)
    }

    pub fn iter(&self) -> impl Iterator<Item = Requirement> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<I: IntoIterator<Item = Requirement>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Requirement; N]> for Requirements {
    fn from(requirements: [Requirement; N]) -> Self {
        requirements.into_iter().collect()
    }
}

/// A named fact published on the cross-plugin data bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub name: String,
    pub value: Value,
}

impl DataRecord {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A declared dependency on another plugin, by name.
///
/// `options` are handed to the loader if the dependency has to be
/// auto-registered; they are ignored when the plugin is already present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub options: Value,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Value::Null,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

impl From<&str> for Dependency {
    fn from(name: &str) -> Self {
        Dependency::new(name)
    }
}

impl From<String> for Dependency {
    fn from(name: String) -> Self {
        Dependency::new(name)
    }
}

/// Which entry point produced a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Launch,
    Connect,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Launch => write!(f, "launch"),
            SessionKind::Connect => write!(f, "connect"),
        }
    }
}
