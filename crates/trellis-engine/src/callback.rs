//! The inbound worker callback protocol.
//!
//! A worker reports exactly one of:
//!
//! ```json
//! { "status": "completed", "output": { ... } }
//! { "status": "failed", "error": "human-readable reason" }
//! ```
//!
//! Anything else is a validation error, rejected before the run state store
//! is touched. Workers may deliver at-least-once: a duplicate `completed`
//! for an already-completed node is acknowledged as a no-op downstream of
//! this parser.

use serde::Serialize;

use crate::error::ValidationError;

/// A parsed, shape-validated worker callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallbackPayload {
  Completed {
    output: serde_json::Map<String, serde_json::Value>,
  },
  Failed {
    error: String,
  },
}

impl CallbackPayload {
  /// Validate a raw callback body against the wire contract.
  ///
  /// Strict by design: unknown fields, a missing or unknown `status`, a
  /// non-object `output`, or mixing `output` with `error` are all rejected.
  pub fn parse(value: &serde_json::Value) -> Result<Self, ValidationError> {
    let body = value
      .as_object()
      .ok_or_else(|| malformed("payload must be a JSON object"))?;

    for key in body.keys() {
      if !matches!(key.as_str(), "status" | "output" | "error") {
        return Err(malformed(format!("unexpected field '{key}'")));
      }
    }

    let status = body
      .get("status")
      .and_then(serde_json::Value::as_str)
      .ok_or_else(|| malformed("missing or non-string 'status'"))?;

    match status {
      "completed" => {
        if body.contains_key("error") {
          return Err(malformed("'completed' callback must not carry 'error'"));
        }
        let output = body
          .get("output")
          .ok_or_else(|| malformed("'completed' callback requires 'output'"))?
          .as_object()
          .cloned()
          .ok_or_else(|| malformed("'output' must be a JSON object"))?;
        Ok(CallbackPayload::Completed { output })
      }
      "failed" => {
        if body.contains_key("output") {
          return Err(malformed("'failed' callback must not carry 'output'"));
        }
        let error = body
          .get("error")
          .and_then(serde_json::Value::as_str)
          .ok_or_else(|| malformed("'failed' callback requires a string 'error'"))?
          .to_string();
        Ok(CallbackPayload::Failed { error })
      }
      other => Err(malformed(format!("unknown status '{other}'"))),
    }
  }
}

fn malformed(message: impl Into<String>) -> ValidationError {
  ValidationError::MalformedCallback(message.into())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn completed_with_object_output_parses() {
    let parsed = CallbackPayload::parse(&json!({
      "status": "completed",
      "output": {"score": 0.9}
    }))
    .unwrap();
    assert!(matches!(parsed, CallbackPayload::Completed { .. }));
  }

  #[test]
  fn failed_with_reason_parses() {
    let parsed = CallbackPayload::parse(&json!({
      "status": "failed",
      "error": "timeout"
    }))
    .unwrap();
    assert_eq!(
      parsed,
      CallbackPayload::Failed {
        error: "timeout".to_string()
      }
    );
  }

  #[test]
  fn rejects_non_object_output() {
    assert!(CallbackPayload::parse(&json!({"status": "completed", "output": [1, 2]})).is_err());
    assert!(CallbackPayload::parse(&json!({"status": "completed"})).is_err());
  }

  #[test]
  fn rejects_mixed_and_unknown_fields() {
    assert!(
      CallbackPayload::parse(&json!({
        "status": "completed",
        "output": {},
        "error": "huh"
      }))
      .is_err()
    );
    assert!(
      CallbackPayload::parse(&json!({
        "status": "failed",
        "error": "x",
        "retry_in": 30
      }))
      .is_err()
    );
  }

  #[test]
  fn rejects_unknown_status_and_non_object_payloads() {
    assert!(CallbackPayload::parse(&json!({"status": "done", "output": {}})).is_err());
    assert!(CallbackPayload::parse(&json!("completed")).is_err());
    assert!(CallbackPayload::parse(&json!({"error": "x"})).is_err());
  }
}
