use serde::{Deserialize, Serialize};

/// An authored workflow graph, as produced by the editor.
///
/// This is the serialization format the editor saves and the compiler
/// consumes. It deliberately carries UI-only fields (`label`, `position`)
/// that the compiler discards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  pub graph_id: String,
  /// Published version counter. A run is always frozen against one version.
  pub version: u32,
  pub name: String,
  pub nodes: Vec<NodeDef>,
  pub edges: Vec<EdgeDef>,
}

/// An authored node: id, typed configuration, and UI metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub id: String,
  #[serde(flatten)]
  pub kind: NodeKind,
  /// Display label. Not part of the executable graph.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  /// Canvas position. Not part of the executable graph.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<serde_json::Value>,
}

/// An authored edge with an optional field mapping for the data that flows
/// across it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub source: String,
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_handle: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_handle: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mapping: Option<FieldMapping>,
}

/// The closed set of executable node types.
///
/// Adding a type means adding a variant here and a firing arm in the engine;
/// there is no open-ended registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
  /// Fire-and-forget call to an external worker service; completion arrives
  /// later through the callback protocol.
  Worker(WorkerConfig),
  /// Fans an array input out into parallel instances of its downstream node.
  Splitter(SplitterConfig),
  /// Waits for every parallel instance upstream of it, then aggregates
  /// their outputs into an ordered array.
  Collector(CollectorConfig),
  /// Suspends the branch until a user supplies input.
  Gate(GateConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Endpoint the engine dispatches the worker call to.
  pub endpoint: String,
  /// Opaque worker configuration, forwarded verbatim in the dispatch payload.
  #[serde(default)]
  pub config: serde_json::Value,
  /// Move the run's tracked entity when this worker completes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entity_move: Option<EntityHop>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitterConfig {
  /// Dot-path into the splitter's input that must resolve to an array.
  pub items_path: String,
  /// Downstream node id to fan out into. Defaults to the splitter's sole
  /// downstream; compiling is an error when that is ambiguous.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fan_out: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
  /// Key the aggregated array is published under in the collector's output.
  #[serde(default = "default_output_key")]
  pub output_key: String,
}

impl Default for CollectorConfig {
  fn default() -> Self {
    Self {
      output_key: default_output_key(),
    }
  }
}

fn default_output_key() -> String {
  "results".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
  /// Prompt shown to the user. Informational only.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prompt: Option<String>,
}

/// Entity relocation performed when a worker node completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHop {
  pub target_section_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_entity_type: Option<String>,
}

/// Field mapping applied when data flows across an edge.
///
/// Each rule extracts a value from the upstream output and places it under a
/// new key in the downstream input. Edges without a mapping fall back to an
/// unkeyed shallow merge of upstream outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
  pub rules: Vec<MappingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
  /// Dot-path into the upstream output.
  pub from: String,
  /// Key in the downstream input.
  pub to: String,
}

impl FieldMapping {
  /// Apply the mapping to one upstream output, writing mapped values into
  /// `into`. Rules whose source path does not resolve are skipped.
  pub fn apply(
    &self,
    source: &serde_json::Value,
    into: &mut serde_json::Map<String, serde_json::Value>,
  ) {
    for rule in &self.rules {
      if let Some(value) = lookup_path(source, &rule.from) {
        into.insert(rule.to.clone(), value.clone());
      }
    }
  }
}

/// Resolve a dot-path (`"a.b.c"`) against a JSON value.
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
  let mut current = value;
  for segment in path.split('.') {
    current = current.get(segment)?;
  }
  Some(current)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn node_kind_round_trips_with_tag() {
    let node: NodeDef = serde_json::from_value(json!({
      "id": "enrich",
      "type": "worker",
      "endpoint": "https://workers.example.com/enrich",
      "config": {"provider": "clearbit"},
      "label": "Enrich lead",
      "position": {"x": 120, "y": 40}
    }))
    .unwrap();

    match &node.kind {
      NodeKind::Worker(cfg) => {
        assert_eq!(cfg.endpoint, "https://workers.example.com/enrich");
        assert_eq!(cfg.config["provider"], "clearbit");
      }
      other => panic!("expected worker, got {other:?}"),
    }
    assert_eq!(node.label.as_deref(), Some("Enrich lead"));
  }

  #[test]
  fn collector_output_key_defaults_to_results() {
    let node: NodeDef = serde_json::from_value(json!({
      "id": "gather",
      "type": "collector"
    }))
    .unwrap();

    match node.kind {
      NodeKind::Collector(cfg) => assert_eq!(cfg.output_key, "results"),
      other => panic!("expected collector, got {other:?}"),
    }
  }

  #[test]
  fn mapping_applies_rules_and_skips_missing_paths() {
    let mapping = FieldMapping {
      rules: vec![
        MappingRule {
          from: "contact.email".to_string(),
          to: "email".to_string(),
        },
        MappingRule {
          from: "missing.path".to_string(),
          to: "nothing".to_string(),
        },
      ],
    };

    let source = json!({"contact": {"email": "a@b.co", "phone": "555"}});
    let mut into = serde_json::Map::new();
    mapping.apply(&source, &mut into);

    assert_eq!(into.get("email"), Some(&json!("a@b.co")));
    assert!(!into.contains_key("nothing"));
  }

  #[test]
  fn lookup_path_walks_nested_objects() {
    let value = json!({"a": {"b": {"c": 3}}});
    assert_eq!(lookup_path(&value, "a.b.c"), Some(&json!(3)));
    assert_eq!(lookup_path(&value, "a.x"), None);
  }
}
