use crate::plugins::{Hook, HookSet, Plugin, PluginOptions};
use crate::types::DataRecord;
use async_trait::async_trait;
use serde_json::{json, Value};

pub const NAME: &str = "launch-args";

/// Appends command-line arguments to every launch.
///
/// Options: `{"args": ["--flag", ...]}`. Arguments already present in the
/// launch options are not duplicated. The configured list is published on
/// the data bus as `launchArgs`.
pub struct LaunchArgs {
    options: PluginOptions,
}

impl LaunchArgs {
    pub fn new(overrides: Value) -> Self {
        Self {
            options: PluginOptions::new(json!({ "args": [] }), overrides),
        }
    }

    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        Self::new(json!({ "args": args }))
    }

    pub fn args(&self) -> Vec<String> {
        self.options
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Returns `options` with `extra` appended to its `args` array.
pub fn append_args(options: &Value, extra: &[String]) -> Value {
    let mut options = match options {
        Value::Object(_) => options.clone(),
        _ => json!({}),
    };
    let mut args: Vec<Value> = options
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for arg in extra {
        if !args.iter().any(|existing| existing.as_str() == Some(arg.as_str())) {
            args.push(Value::String(arg.clone()));
        }
    }
    options["args"] = Value::Array(args);
    options
}

#[async_trait]
impl Plugin for LaunchArgs {
    fn name(&self) -> &str {
        NAME
    }

    fn defaults(&self) -> Value {
        json!({ "args": [] })
    }

    fn options(&self) -> &Value {
        self.options.as_value()
    }

    fn data(&self) -> Vec<DataRecord> {
        vec![DataRecord::new("launchArgs", self.args())]
    }

    fn hooks(&self) -> HookSet {
        HookSet::from([Hook::BeforeLaunch])
    }

    async fn before_launch(&self, options: &Value) -> anyhow::Result<Option<Value>> {
        let args = self.args();
        if args.is_empty() {
            return Ok(None);
        }
        Ok(Some(append_args(options, &args)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_without_duplicates() {
        let plugin = LaunchArgs::with_args(["--lang=en", "--mute-audio"]);
        let options = json!({"headless": true, "args": ["--mute-audio"]});

        let updated = plugin.before_launch(&options).await.unwrap().unwrap();
        assert_eq!(updated["args"], json!(["--mute-audio", "--lang=en"]));
        assert_eq!(updated["headless"], json!(true));
    }

    #[tokio::test]
    async fn empty_args_leave_options_alone() {
        let plugin = LaunchArgs::new(Value::Null);
        assert!(plugin.before_launch(&json!({})).await.unwrap().is_none());
    }

    #[test]
    fn publishes_configured_args() {
        let plugin = LaunchArgs::with_args(["--a"]);
        assert_eq!(plugin.data(), vec![DataRecord::new("launchArgs", json!(["--a"]))]);
    }
}
