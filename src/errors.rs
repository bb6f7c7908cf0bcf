use crate::plugins::Hook;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtraError {
    #[error("Plugin '{required_by}' depends on '{name}' but no loader is configured")]
    MissingDependency { name: String, required_by: String },

    #[error("Failed to load dependency '{name}': {source}")]
    DependencyLoad {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Dependency '{requested}' resolved to a plugin that could not satisfy it: {reason}")]
    DependencyMismatch { requested: String, reason: String },

    #[error("Plugin '{plugin}' failed in {hook}: {source}")]
    Hook {
        plugin: String,
        hook: Hook,
        #[source]
        source: anyhow::Error,
    },

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Browser connect failed: {0}")]
    ConnectFailed(String),

    #[error("Page creation failed: {0}")]
    PageCreationFailed(String),

    #[error("Browser already closed")]
    BrowserClosed,

    #[error("Unsupported by {engine}: {operation}")]
    Unsupported { engine: String, operation: String },

    #[error("Invalid launch options: {0}")]
    InvalidOptions(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Chrome error: {0}")]
    ChromeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Anyhow error: {0}")]
    AnyhowError(String),
}

pub type Result<T> = std::result::Result<T, ExtraError>;

// Convert anyhow::Error to ExtraError
impl From<anyhow::Error> for ExtraError {
    fn from(err: anyhow::Error) -> Self {
        ExtraError::AnyhowError(err.to_string())
    }
}

impl ExtraError {
    pub fn from_any_error<E: std::fmt::Display>(err: E) -> Self {
        ExtraError::ChromeError(err.to_string())
    }

    pub fn unsupported(engine: impl std::fmt::Display, operation: impl Into<String>) -> Self {
        ExtraError::Unsupported {
            engine: engine.to_string(),
            operation: operation.into(),
        }
    }

    /// Name of the plugin a hook failure came from, if any.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            ExtraError::Hook { plugin, .. } => Some(plugin),
            ExtraError::MissingDependency { required_by, .. } => Some(required_by),
            _ => None,
        }
    }
}
