//! Info extractor: the `info` documentation field to a `.md` file, for any
//! node type that carries one.

use super::Extractor;
use crate::error::SyncError;
use crate::graph::Node;
use serde_json::{Map, Value};
use std::path::Path;

pub struct InfoExtractor;

impl Extractor for InfoExtractor {
    fn name(&self) -> &'static str {
        "info"
    }

    fn priority(&self) -> u32 {
        250
    }

    fn can_handle(&self, node: &Node) -> bool {
        node.contains_key("info")
    }

    fn claimed_fields(&self, _node: &Node) -> Vec<String> {
        vec!["info".to_string()]
    }

    fn explode_node(&self, node: &Node, node_dir: &Path) -> Result<Vec<String>, SyncError> {
        let node_id = crate::graph::node_id(node).unwrap_or_default();
        let info = node.get("info").and_then(Value::as_str).unwrap_or("");
        if info.is_empty() {
            return Ok(Vec::new());
        }
        let filename = format!("{node_id}.md");
        std::fs::write(node_dir.join(&filename), info)?;
        Ok(vec![filename])
    }

    fn rebuild_node(
        &self,
        node_id: &str,
        node_dir: &Path,
        merged: &Node,
    ) -> Result<Node, SyncError> {
        let mut data = Map::new();
        let md_file = node_dir.join(format!("{node_id}.md"));
        if md_file.exists() {
            data.insert("info".to_string(), std::fs::read_to_string(md_file)?.into());
        } else if merged.contains_key("info") {
            data.insert("info".to_string(), Value::String(String::new()));
        }
        Ok(data)
    }
}
