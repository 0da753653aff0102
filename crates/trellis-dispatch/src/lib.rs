//! Trellis Dispatch
//!
//! The outbound half of the worker wire contract. The engine builds a
//! [`WorkerCall`] and hands it to a [`WorkerDispatcher`]; the worker is
//! expected to acknowledge receipt and later report its outcome to the
//! call's `callback_url` (the inbound half lives in `trellis-engine`).
//!
//! [`HttpDispatcher`] is the production implementation: POST the call as
//! JSON to the node's configured endpoint. Tests and the CLI substitute
//! their own dispatcher to loop callbacks straight back into the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Error type for worker dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
  /// The worker endpoint answered with a non-success status.
  #[error("worker endpoint rejected call: HTTP {status}")]
  Rejected { status: u16 },

  /// The call never reached the endpoint.
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  /// The node's configured endpoint is not a valid URL.
  #[error("invalid worker endpoint '{endpoint}': {message}")]
  InvalidEndpoint { endpoint: String, message: String },
}

/// The payload dispatched to an external worker.
///
/// This is the entire outbound contract: everything the worker needs to do
/// its job and to report back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCall {
  pub run_id: String,
  pub node_id: String,
  /// Opaque node configuration, forwarded verbatim from the graph.
  pub config: serde_json::Value,
  pub input: serde_json::Value,
  /// Where the worker reports completion or failure.
  pub callback_url: String,
}

/// Boundary trait for delivering worker calls.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
  /// The callback URL a worker for `node_id` of `run_id` should report to.
  fn callback_url(&self, run_id: &str, node_id: &str) -> String;

  /// Deliver the call to the worker endpoint. Fire-and-forget from the
  /// engine's perspective: success means the worker accepted the call, not
  /// that it finished.
  async fn dispatch(&self, endpoint: &str, call: WorkerCall) -> Result<(), DispatchError>;
}

/// HTTP dispatcher: POSTs worker calls as JSON.
pub struct HttpDispatcher {
  client: reqwest::Client,
  callback_base: Url,
}

impl HttpDispatcher {
  /// `callback_base` is the externally reachable base URL of the engine's
  /// callback endpoint, e.g. `https://engine.example.com/api/`.
  pub fn new(callback_base: Url) -> Self {
    Self {
      client: reqwest::Client::new(),
      callback_base,
    }
  }
}

#[async_trait]
impl WorkerDispatcher for HttpDispatcher {
  fn callback_url(&self, run_id: &str, node_id: &str) -> String {
    let mut url = self.callback_base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
      segments
        .pop_if_empty()
        .extend(["runs", run_id, "nodes", node_id, "callback"]);
    }
    url.to_string()
  }

  async fn dispatch(&self, endpoint: &str, call: WorkerCall) -> Result<(), DispatchError> {
    let endpoint_url =
      Url::parse(endpoint).map_err(|e| DispatchError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
      })?;

    let response = self.client.post(endpoint_url).json(&call).send().await?;

    if !response.status().is_success() {
      return Err(DispatchError::Rejected {
        status: response.status().as_u16(),
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn callback_url_nests_run_and_node() {
    let dispatcher = HttpDispatcher::new(Url::parse("https://engine.example.com/api/").unwrap());
    assert_eq!(
      dispatcher.callback_url("run-1", "enrich_0"),
      "https://engine.example.com/api/runs/run-1/nodes/enrich_0/callback"
    );
  }

  #[test]
  fn callback_url_tolerates_missing_trailing_slash() {
    let dispatcher = HttpDispatcher::new(Url::parse("https://engine.example.com/api").unwrap());
    assert_eq!(
      dispatcher.callback_url("r", "n"),
      "https://engine.example.com/api/runs/r/nodes/n/callback"
    );
  }

  #[test]
  fn worker_call_serializes_the_full_contract() {
    let call = WorkerCall {
      run_id: "r1".to_string(),
      node_id: "enrich".to_string(),
      config: json!({"provider": "clearbit"}),
      input: json!({"email": "a@b.co"}),
      callback_url: "https://engine.example.com/api/runs/r1/nodes/enrich/callback".to_string(),
    };

    let value = serde_json::to_value(&call).unwrap();
    assert_eq!(value["run_id"], "r1");
    assert_eq!(value["node_id"], "enrich");
    assert_eq!(value["config"]["provider"], "clearbit");
    assert_eq!(value["input"]["email"], "a@b.co");
    assert!(value["callback_url"].as_str().unwrap().ends_with("/callback"));
  }

  #[tokio::test]
  async fn invalid_endpoint_is_rejected_before_sending() {
    let dispatcher = HttpDispatcher::new(Url::parse("https://engine.example.com/").unwrap());
    let call = WorkerCall {
      run_id: "r1".to_string(),
      node_id: "n".to_string(),
      config: serde_json::Value::Null,
      input: serde_json::Value::Null,
      callback_url: dispatcher.callback_url("r1", "n"),
    };
    let err = dispatcher.dispatch("not a url", call).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidEndpoint { .. }));
  }
}
