//! Streamed tool-call assembly and dispatch
//!
//! The session streams a tool invocation in pieces: an added event with the
//! call id and name, argument deltas, and a done event. Nothing guarantees
//! their order, and done can arrive without a prior added, so records are
//! created lazily on first reference and fields merged as they appear.
//! Execution is gated on having a name and completed arguments, and happens
//! at most once per call id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

/// Outcome envelope every tool resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Ok(Value),
    Err { code: String, message: String },
}

impl ToolOutcome {
    /// The JSON payload injected back into the conversation.
    #[must_use]
    pub fn into_payload(self) -> Value {
        match self {
            Self::Ok(data) => serde_json::json!({ "ok": true, "data": data }),
            Self::Err { code, message } => serde_json::json!({
                "ok": false,
                "error": { "code": code, "message": message },
            }),
        }
    }
}

/// The capability set exposed to the model.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Tool schemas advertised in the session configuration.
    fn schemas(&self) -> Vec<Value>;

    /// Execute one named tool. Failures are data, not errors: they come
    /// back as [`ToolOutcome::Err`] and flow into the conversation.
    async fn dispatch(&self, name: &str, args: Value) -> ToolOutcome;
}

/// One partially assembled tool invocation.
#[derive(Debug, Clone, Default)]
struct PendingToolCall {
    name: Option<String>,
    args_text: String,
    args_done: bool,
    executed: bool,
}

/// Pending tool calls for the current connection, keyed by call id.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    calls: HashMap<String, PendingToolCall>,
}

impl ToolCallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an added event.
    pub fn note_added(&mut self, call_id: &str, name: &str) {
        let call = self.calls.entry(call_id.to_string()).or_default();
        if call.name.is_none() && !name.is_empty() {
            call.name = Some(name.to_string());
        }
    }

    /// Append an arguments delta.
    pub fn note_args_delta(&mut self, call_id: &str, delta: &str) {
        let call = self.calls.entry(call_id.to_string()).or_default();
        call.args_text.push_str(delta);
    }

    /// Merge a done event. A complete `arguments` string, when present,
    /// replaces whatever the deltas accumulated.
    pub fn note_args_done(&mut self, call_id: &str, name: Option<&str>, arguments: Option<&str>) {
        let call = self.calls.entry(call_id.to_string()).or_default();
        if call.name.is_none() {
            call.name = name.filter(|n| !n.is_empty()).map(ToString::to_string);
        }
        if let Some(arguments) = arguments {
            call.args_text = arguments.to_string();
        }
        call.args_done = true;
    }

    /// Take the call for execution if it is complete and has not run yet.
    ///
    /// A buffer that does not parse as JSON is treated as empty arguments.
    pub fn take_ready(&mut self, call_id: &str) -> Option<(String, Value)> {
        let call = self.calls.get_mut(call_id)?;
        if call.executed || !call.args_done {
            return None;
        }
        let name = call.name.clone()?;
        call.executed = true;
        let args = serde_json::from_str(&call.args_text)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Some((name, args))
    }

    /// Drop all pending state. Called on disconnect so nothing stale runs
    /// against a new session.
    pub fn clear(&mut self) {
        self.calls.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_in_order() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "query_devices");
        registry.note_args_delta("c1", r#"{"zone""#);
        registry.note_args_delta("c1", r#":"lab"}"#);
        assert!(registry.take_ready("c1").is_none(), "must wait for done");

        registry.note_args_done("c1", None, None);
        let (name, args) = registry.take_ready("c1").unwrap();
        assert_eq!(name, "query_devices");
        assert_eq!(args["zone"], "lab");
    }

    #[test]
    fn tolerates_done_before_added() {
        let mut registry = ToolCallRegistry::new();
        registry.note_args_done("c1", None, Some(r#"{"page":2}"#));
        assert!(registry.take_ready("c1").is_none(), "no name yet");

        registry.note_added("c1", "query_devices");
        let (name, args) = registry.take_ready("c1").unwrap();
        assert_eq!(name, "query_devices");
        assert_eq!(args["page"], 2);
    }

    #[test]
    fn done_with_name_alone_is_sufficient() {
        let mut registry = ToolCallRegistry::new();
        registry.note_args_done("c1", Some("list_zones"), Some("{}"));
        let (name, args) = registry.take_ready("c1").unwrap();
        assert_eq!(name, "list_zones");
        assert!(args.as_object().unwrap().is_empty());
    }

    #[test]
    fn executes_at_most_once() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "list_zones");
        registry.note_args_done("c1", None, Some("{}"));
        assert!(registry.take_ready("c1").is_some());
        assert!(registry.take_ready("c1").is_none());

        // A duplicate done event does not re-arm it
        registry.note_args_done("c1", None, Some("{}"));
        assert!(registry.take_ready("c1").is_none());
    }

    #[test]
    fn malformed_arguments_parse_as_empty_object() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "list_zones");
        registry.note_args_delta("c1", r#"{"zone": "#);
        registry.note_args_done("c1", None, None);

        let (_, args) = registry.take_ready("c1").unwrap();
        assert_eq!(args, Value::Object(serde_json::Map::new()));
    }

    #[test]
    fn complete_arguments_replace_accumulated_deltas() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "query_devices");
        registry.note_args_delta("c1", r#"{"zo"#);
        registry.note_args_done("c1", None, Some(r#"{"zone":"lab"}"#));

        let (_, args) = registry.take_ready("c1").unwrap();
        assert_eq!(args["zone"], "lab");
    }

    #[test]
    fn concurrent_calls_do_not_interfere() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "list_zones");
        registry.note_added("c2", "list_device_types");
        registry.note_args_done("c2", None, Some("{}"));
        registry.note_args_done("c1", None, Some("{}"));

        assert_eq!(registry.take_ready("c2").unwrap().0, "list_device_types");
        assert_eq!(registry.take_ready("c1").unwrap().0, "list_zones");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn clear_drops_pending_state() {
        let mut registry = ToolCallRegistry::new();
        registry.note_added("c1", "list_zones");
        registry.clear();
        assert!(registry.is_empty());
        registry.note_args_done("c1", None, Some("{}"));
        assert!(registry.take_ready("c1").is_none(), "name was lost with the clear");
    }

    #[test]
    fn outcome_envelopes() {
        let ok = ToolOutcome::Ok(serde_json::json!({"zones": ["lab"]}));
        let payload = ok.into_payload();
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["data"]["zones"][0], "lab");

        let err = ToolOutcome::Err {
            code: "unknown-zone".to_string(),
            message: "no such zone".to_string(),
        };
        let payload = err.into_payload();
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"]["code"], "unknown-zone");
    }
}
