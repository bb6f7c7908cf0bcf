use crate::browser::ShimPage;
use crate::errors::{ExtraError, Result};
use crate::plugins::{DataBus, Hook, HookSet, Plugin, PluginOptions};
use crate::types::{Requirement, Requirements};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub const NAME: &str = "user-agent-override";

/// Rewrites the user agent of every new page.
///
/// The agent comes from, in order: the `userAgent` option, the first string
/// published as `userAgent` on the data bus, or the page's current agent.
/// Every match of `pattern` is then replaced with `replacement`, which by
/// default hides the `HeadlessChrome` token.
pub struct UserAgentOverride {
    options: PluginOptions,
    pattern: Regex,
    bus: OnceLock<DataBus>,
}

impl UserAgentOverride {
    pub fn new(overrides: Value) -> Result<Self> {
        let options = PluginOptions::new(Self::default_options(), overrides);
        let raw = options.get_str("pattern").unwrap_or("HeadlessChrome/");
        let pattern = Regex::new(raw)
            .map_err(|e| ExtraError::ConfigurationError(format!("{}: {}", NAME, e)))?;
        Ok(Self {
            options,
            pattern,
            bus: OnceLock::new(),
        })
    }

    fn default_options() -> Value {
        json!({
            "userAgent": null,
            "pattern": "HeadlessChrome/",
            "replacement": "Chrome/",
            "acceptLanguage": "en-US,en",
            "platform": null
        })
    }

    /// Applies the configured rewrite to `user_agent`.
    pub fn rewrite(&self, user_agent: &str) -> String {
        let replacement = self.options.get_str("replacement").unwrap_or("");
        self.pattern.replace_all(user_agent, replacement).into_owned()
    }

    fn published_user_agent(&self) -> Option<String> {
        self.bus.get().and_then(|bus| {
            bus.values("userAgent")
                .into_iter()
                .find_map(|value| value.as_str().map(str::to_string))
        })
    }
}

#[async_trait]
impl Plugin for UserAgentOverride {
    fn name(&self) -> &str {
        NAME
    }

    fn defaults(&self) -> Value {
        Self::default_options()
    }

    fn options(&self) -> &Value {
        self.options.as_value()
    }

    fn requirements(&self) -> Requirements {
        Requirements::from([Requirement::RunLast, Requirement::WantsCrossPluginData])
    }

    fn hooks(&self) -> HookSet {
        HookSet::from([Hook::PageCreated])
    }

    fn attach_data_bus(&self, bus: DataBus) {
        let _ = self.bus.set(bus);
    }

    async fn on_page_created(&self, page: Arc<ShimPage>) -> anyhow::Result<()> {
        let current = match self.options.get_str("userAgent") {
            Some(configured) => configured.to_string(),
            None => match self.published_user_agent() {
                Some(published) => published,
                None => page.user_agent().await?,
            },
        };
        let user_agent = self.rewrite(&current);
        debug!(page = %page.target_id(), user_agent = %user_agent, "Overriding user agent");

        page.set_user_agent(
            &user_agent,
            self.options.get_str("acceptLanguage"),
            self.options.get_str("platform"),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_headless_token() {
        let plugin = UserAgentOverride::new(Value::Null).unwrap();
        assert_eq!(
            plugin.rewrite("Mozilla/5.0 HeadlessChrome/120.0.0.0 Safari/537.36"),
            "Mozilla/5.0 Chrome/120.0.0.0 Safari/537.36"
        );
    }

    #[test]
    fn custom_pattern() {
        let plugin = UserAgentOverride::new(json!({
            "pattern": r"\(X11; Linux x86_64\)",
            "replacement": "(Windows NT 10.0; Win64; x64)"
        }))
        .unwrap();
        assert_eq!(
            plugin.rewrite("Mozilla/5.0 (X11; Linux x86_64) Chrome/120"),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120"
        );
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let err = UserAgentOverride::new(json!({"pattern": "("}))
            .err()
            .expect("pattern should not compile");
        assert!(matches!(err, ExtraError::ConfigurationError(_)));
    }

    #[test]
    fn runs_last_and_reads_the_bus() {
        let requirements = UserAgentOverride::new(Value::Null).unwrap().requirements();
        assert!(requirements.contains(Requirement::RunLast));
        assert!(requirements.contains(Requirement::WantsCrossPluginData));
    }
}
