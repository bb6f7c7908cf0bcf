use crate::types::SessionKind;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Mutable state of one launch or connect call, threaded through the
/// `before_*` phase.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: Uuid,
    pub kind: SessionKind,
    pub options: Value,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    /// A missing or `null` options bag becomes an empty object.
    pub fn new(kind: SessionKind, options: Value) -> Self {
        let options = match options {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            options,
            started_at: Utc::now(),
        }
    }

    pub fn is_launch(&self) -> bool {
        self.kind == SessionKind::Launch
    }

    /// Whether the options ask for a headless browser.
    ///
    /// `headless: true` and any string mode (`"new"`, `"shell"`) count;
    /// `false`, `"false"`, an empty string or a missing key do not.
    pub fn requests_headless(&self) -> bool {
        requests_headless(&self.options)
    }
}

/// See [`SessionContext::requests_headless`].
pub fn requests_headless(options: &Value) -> bool {
    match options.get("headless") {
        Some(Value::Bool(headless)) => *headless,
        Some(Value::String(mode)) => !mode.is_empty() && mode != "false",
        _ => false,
    }
}
