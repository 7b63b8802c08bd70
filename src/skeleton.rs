//! Skeleton file management.
//!
//! The skeleton is the structural projection of a flows document: structural
//! fields keep their values, functional fields are blanked to
//! type-appropriate placeholders so field order and shape survive. Each
//! entry carries `_explode_meta` mapping extractor names to the files they
//! produced, plus a `stable` flag from round-trip verification.

use crate::error::SyncError;
use crate::graph::{self, Node};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reserved skeleton file name at the tree root.
pub const SKELETON_FILENAME: &str = ".flow-skeleton.json";

/// Reserved subtree for orphaned files.
pub const ORPHAN_DIRNAME: &str = ".orphaned";

/// Metadata key on skeleton entries.
pub const META_KEY: &str = "_explode_meta";

/// Meta entry name for the node-local base file (written by the codec
/// itself, not by an extractor).
pub const BASE_META_KEY: &str = "base";

/// Directory where a node's files live.
///
/// Nodes without a `z`, or whose `z` does not name a known tab/subflow,
/// go to the tree root; everything else goes under `<root>/<z>/`.
pub fn node_directory(node: &Node, src_dir: &Path, containers: &HashSet<String>) -> PathBuf {
    match node.get("z").and_then(Value::as_str) {
        Some(z) if !z.is_empty() && containers.contains(z) => src_dir.join(z),
        _ => src_dir.to_path_buf(),
    }
}

/// Type-appropriate empty placeholder for a functional field value.
pub fn blank_placeholder(value: &Value) -> Value {
    match value {
        Value::String(_) => Value::String(String::new()),
        Value::Array(_) => Value::Array(Vec::new()),
        Value::Object(_) => Value::Object(Map::new()),
        Value::Bool(_) => Value::Bool(false),
        Value::Number(_) => Value::from(0),
        Value::Null => Value::Null,
    }
}

/// Build the skeleton entry for a node: structural fields keep their
/// values, functional fields become placeholders, original order preserved.
pub fn create_skeleton(node: &Node) -> Node {
    let mut skeleton = Map::new();
    for (field, value) in node {
        if graph::is_structural(field) {
            skeleton.insert(field.clone(), value.clone());
        } else {
            skeleton.insert(field.clone(), blank_placeholder(value));
        }
    }
    skeleton
}

/// Attach `_explode_meta` to a skeleton entry.
pub fn set_meta(entry: &mut Node, files_by_extractor: Map<String, Value>, stable: Option<bool>) {
    let mut meta = files_by_extractor;
    meta.insert(
        "stable".to_string(),
        stable.map(Value::Bool).unwrap_or(Value::Null),
    );
    entry.insert(META_KEY.to_string(), Value::Object(meta));
}

/// Iterate the `(extractor, files)` pairs recorded in an entry's metadata.
pub fn meta_files(entry: &Node) -> Vec<(String, Vec<String>)> {
    let Some(Value::Object(meta)) = entry.get(META_KEY) else {
        return Vec::new();
    };
    meta.iter()
        .filter(|(key, _)| key.as_str() != "stable")
        .filter_map(|(key, value)| {
            value.as_array().map(|files| {
                let names = files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                (key.clone(), names)
            })
        })
        .collect()
}

/// The `stable` flag from an entry's metadata, if verification ran.
pub fn entry_stable(entry: &Node) -> Option<bool> {
    entry
        .get(META_KEY)
        .and_then(|meta| meta.get("stable"))
        .and_then(Value::as_bool)
}

/// Write the skeleton list to `<src_dir>/.flow-skeleton.json`, compact with
/// a trailing newline for git-friendly diffs.
pub fn save_skeleton(src_dir: &Path, skeleton: &[Node]) -> Result<(), SyncError> {
    let mut text = serde_json::to_string(skeleton)?;
    text.push('\n');
    std::fs::write(src_dir.join(SKELETON_FILENAME), text)?;
    Ok(())
}

/// Load the skeleton for rebuilding.
///
/// Falls back to the flows document itself when the skeleton file is
/// missing, so a tree that was never exploded can still be rebuilt.
pub fn load_skeleton(src_dir: &Path, document_path: Option<&Path>) -> Result<Vec<Node>, SyncError> {
    let skeleton_file = src_dir.join(SKELETON_FILENAME);
    if skeleton_file.exists() {
        let text = std::fs::read_to_string(&skeleton_file)?;
        return graph::parse_document(&text);
    }

    warn!("Skeleton file not found: {}", skeleton_file.display());
    match document_path {
        Some(path) if path.exists() => {
            info!("Using {} as skeleton fallback", path.display());
            graph::load_document(path)
        }
        _ => Err(SyncError::InvalidDocument(
            "neither skeleton file nor flows document found".to_string(),
        )),
    }
}

/// Validate that `path` stays inside `base` once resolved. Guards codec file
/// access against ids crafted to escape the tree.
pub fn ensure_within(base: &Path, path: &Path) -> Result<PathBuf, SyncError> {
    let base = base.canonicalize()?;
    let resolved = path.canonicalize()?;
    if resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(SyncError::PathEscape(path.to_path_buf()))
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
    fn skeleton_blanks_functional_fields_only() {
        let node = node_from(json!({
            "id": "n1",
            "type": "function",
            "z": "t1",
            "name": "double",
            "func": "return msg;",
            "outputs": 2,
            "noerr": false,
            "libs": [],
            "env": {"A": 1},
            "x": 120,
            "y": 80,
            "wires": [["n2"], []]
        }));

        let skeleton = create_skeleton(&node);

        // Structural fields keep real values.
        assert_eq!(skeleton["id"], json!("n1"));
        assert_eq!(skeleton["z"], json!("t1"));
        assert_eq!(skeleton["wires"], json!([["n2"], []]));
        // Functional fields become typed placeholders.
        assert_eq!(skeleton["name"], json!(""));
        assert_eq!(skeleton["func"], json!(""));
        assert_eq!(skeleton["outputs"], json!(0));
        assert_eq!(skeleton["noerr"], json!(false));
        assert_eq!(skeleton["libs"], json!([]));
        assert_eq!(skeleton["env"], json!({}));
        // Order is preserved.
        let keys: Vec<&String> = skeleton.keys().collect();
        let original_keys: Vec<&String> = node.keys().collect();
        assert_eq!(keys, original_keys);
    }

    #[test]
    fn node_directory_routes_dangling_z_to_root() {
        let containers: HashSet<String> = ["t1".to_string()].into_iter().collect();
        let root = Path::new("/tmp/tree");

        let in_tab = node_from(json!({"id": "a", "z": "t1"}));
        let dangling = node_from(json!({"id": "b", "z": "missing"}));
        let no_z = node_from(json!({"id": "c"}));

        assert_eq!(node_directory(&in_tab, root, &containers), root.join("t1"));
        assert_eq!(node_directory(&dangling, root, &containers), root);
        assert_eq!(node_directory(&no_z, root, &containers), root);
    }

    #[test]
    fn meta_roundtrip() {
        let mut entry = node_from(json!({"id": "n1", "type": "function"}));
        let mut files = Map::new();
        files.insert("func".to_string(), json!(["n1.js"]));
        files.insert(BASE_META_KEY.to_string(), json!(["n1.json"]));
        set_meta(&mut entry, files, Some(true));

        assert_eq!(entry_stable(&entry), Some(true));
        let listed = meta_files(&entry);
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&("func".to_string(), vec!["n1.js".to_string()])));
    }
}
