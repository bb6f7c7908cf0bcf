use crate::errors::{ExtraError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub failure_policy: FailurePolicy,
    /// Upper bound on how long `Browser::new_page` waits for the page-created
    /// fan-out of the new page.
    pub page_ready_timeout_ms: u64,
    /// Bind close hooks to SIGINT/SIGTERM/SIGHUP for launched browsers.
    pub bind_exit_signals: bool,
    /// Emit advisory warnings for unmet plugin requirements.
    pub check_requirements: bool,
}

/// What the dispatcher does when a plugin hook returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the phase and surface the error to the caller.
    AbortPhase,
    /// Log the error and keep going with the next plugin.
    Continue,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            page_ready_timeout_ms: 5000,
            bind_exit_signals: true,
            check_requirements: true,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::AbortPhase
    }
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_ready_timeout_ms == 0 {
            return Err(ExtraError::ConfigurationError(
                "page_ready_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn page_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.page_ready_timeout_ms)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_exit_signals(mut self, enabled: bool) -> Self {
        self.bind_exit_signals = enabled;
        self
    }

    pub fn with_page_ready_timeout(mut self, timeout: Duration) -> Self {
        self.page_ready_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
