use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Deep-merge `overrides` into `defaults`.
///
/// Objects merge key by key, recursively. Any other override value replaces
/// the default wholesale (arrays are not concatenated). `null` overrides
/// leave the default untouched.
pub fn deep_merge(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (_, Value::Null) => defaults.clone(),
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in patch {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// A plugin's options: defaults merged with user overrides once, at
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOptions {
    merged: Value,
}

impl PluginOptions {
    pub fn new(defaults: Value, overrides: Value) -> Self {
        Self {
            merged: deep_merge(&defaults, &overrides),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn as_value(&self) -> &Value {
        &self.merged
    }

    pub fn parse<T: DeserializeOwned>(&self) -> crate::errors::Result<T> {
        Ok(serde_json::from_value(self.merged.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_merge_and_scalars_replace() {
        let defaults = json!({
            "blockTrackers": true,
            "proxy": {"host": "localhost", "port": 8080},
            "args": ["--a"]
        });
        let overrides = json!({
            "proxy": {"port": 3128},
            "args": ["--b"],
            "extra": 1
        });

        assert_eq!(
            deep_merge(&defaults, &overrides),
            json!({
                "blockTrackers": true,
                "proxy": {"host": "localhost", "port": 3128},
                "args": ["--b"],
                "extra": 1
            })
        );
    }

    #[test]
    fn null_override_keeps_defaults() {
        let defaults = json!({"enabled": true});
        assert_eq!(deep_merge(&defaults, &Value::Null), defaults);
        assert_eq!(
            deep_merge(&defaults, &json!({"enabled": null})),
            json!({"enabled": true})
        );
    }

    #[test]
    fn typed_access() {
        #[derive(serde::Deserialize)]
        struct Settings {
            locale: String,
        }

        let options = PluginOptions::new(json!({"locale": "en-US", "platform": null}), json!({}));
        assert_eq!(options.get_str("locale"), Some("en-US"));
        assert!(options.get("platform").is_none());
        assert_eq!(options.parse::<Settings>().unwrap().locale, "en-US");
    }
}
