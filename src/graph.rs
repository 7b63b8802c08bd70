//! Flows document model.
//!
//! A flows document is a JSON array of node objects. Nodes are kept as
//! insertion-ordered JSON maps rather than typed structs: the set of
//! functional fields is open-ended and field order must survive a full
//! explode/rebuild round trip byte-for-byte.

use crate::error::SyncError;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// A single node: ordered map of field name to value.
pub type Node = Map<String, Value>;

/// Fields that describe graph structure rather than node behavior.
/// These keep their real values in the skeleton.
pub const STRUCTURAL_FIELDS: [&str; 6] = ["id", "type", "z", "x", "y", "wires"];

/// Node types that act as containers (their id becomes a subdirectory).
pub const CONTAINER_TYPES: [&str; 2] = ["tab", "subflow"];

/// Extract a node's id, if present and a string.
pub fn node_id(node: &Node) -> Option<&str> {
    node.get("id").and_then(Value::as_str)
}

/// Extract a node's type, defaulting to the empty string.
pub fn node_type(node: &Node) -> &str {
    node.get("type").and_then(Value::as_str).unwrap_or("")
}

pub fn is_structural(field: &str) -> bool {
    STRUCTURAL_FIELDS.contains(&field)
}

/// Collect the ids of all tab/subflow nodes in a document.
pub fn container_ids(document: &[Node]) -> HashSet<String> {
    document
        .iter()
        .filter(|node| CONTAINER_TYPES.contains(&node_type(node)))
        .filter_map(|node| node_id(node).map(str::to_string))
        .collect()
}

/// Serialize a document compactly (no extraneous whitespace) with a
/// trailing newline, the on-disk and on-wire format for flows.
pub fn to_compact_json(document: &[Node]) -> String {
    let mut text = serde_json::to_string(document).unwrap_or_else(|_| "[]".to_string());
    text.push('\n');
    text
}

/// Serialize a single node compactly, excluding the given fields.
/// Used for node base files and round-trip comparison.
pub fn node_to_compact_json(node: &Node, exclude: &[&str]) -> String {
    let filtered: Map<String, Value> = node
        .iter()
        .filter(|(key, _)| !exclude.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    serde_json::to_string(&filtered).unwrap_or_else(|_| "{}".to_string())
}

/// Parse a flows document from JSON text.
///
/// Accepts only a top-level array of objects; anything else is rejected so
/// malformed documents fail before the codec touches the tree.
pub fn parse_document(text: &str) -> Result<Vec<Node>, SyncError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Array(items) = value else {
        return Err(SyncError::InvalidDocument(format!(
            "expected an array of nodes, got {}",
            json_type_name(&value)
        )));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::InvalidDocument(format!(
                "expected a node object, got {}",
                json_type_name(&other)
            ))),
        })
        .collect()
}

/// Load and parse a flows document from disk.
pub fn load_document(path: &Path) -> Result<Vec<Node>, SyncError> {
    let text = std::fs::read_to_string(path)?;
    parse_document(&text)
}

/// Write a flows document to disk in the compact format.
pub fn write_document(path: &Path, document: &[Node]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, to_compact_json(document))?;
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_from(value: Value) -> Node {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parse_rejects_non_array() {
        let err = parse_document("{\"flows\":[]}").unwrap_err();
        assert!(matches!(err, SyncError::InvalidDocument(_)));
    }

    #[test]
    fn parse_rejects_non_object_elements() {
        let err = parse_document("[1,2,3]").unwrap_err();
        assert!(matches!(err, SyncError::InvalidDocument(_)));
    }

    #[test]
    fn compact_serialization_preserves_field_order() {
        let doc = parse_document(r#"[{"id":"n1","type":"inject","z":"t1","x":1,"y":2,"wires":[[]]}]"#)
            .unwrap();
        assert_eq!(
            to_compact_json(&doc),
            "[{\"id\":\"n1\",\"type\":\"inject\",\"z\":\"t1\",\"x\":1,\"y\":2,\"wires\":[[]]}]\n"
        );
    }

    #[test]
    fn container_ids_collects_tabs_and_subflows() {
        let doc = vec![
            node_from(json!({"id": "t1", "type": "tab"})),
            node_from(json!({"id": "s1", "type": "subflow"})),
            node_from(json!({"id": "n1", "type": "inject", "z": "t1"})),
        ];
        let containers = container_ids(&doc);
        assert!(containers.contains("t1"));
        assert!(containers.contains("s1"));
        assert!(!containers.contains("n1"));
    }
}
