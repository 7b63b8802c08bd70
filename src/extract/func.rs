//! Function-node extractor: `func`, `initialize`, and `finalize` code to
//! `.js` files.

use super::Extractor;
use crate::error::SyncError;
use crate::graph::Node;
use serde_json::{Map, Value};
use std::path::Path;

pub struct FuncExtractor;

fn string_field<'a>(node: &'a Node, field: &str) -> Option<&'a str> {
    node.get(field).and_then(Value::as_str)
}

fn write_if_nonempty(
    node_dir: &Path,
    filename: &str,
    content: Option<&str>,
    created: &mut Vec<String>,
) -> Result<(), SyncError> {
    if let Some(content) = content {
        if !content.is_empty() {
            std::fs::write(node_dir.join(filename), content)?;
            created.push(filename.to_string());
        }
    }
    Ok(())
}

impl Extractor for FuncExtractor {
    fn name(&self) -> &'static str {
        "func"
    }

    fn priority(&self) -> u32 {
        230
    }

    fn can_handle(&self, node: &Node) -> bool {
        crate::graph::node_type(node) == "function"
            && string_field(node, "func").is_some_and(|code| !code.is_empty())
    }

    fn claimed_fields(&self, _node: &Node) -> Vec<String> {
        vec![
            "func".to_string(),
            "initialize".to_string(),
            "finalize".to_string(),
        ]
    }

    fn explode_node(&self, node: &Node, node_dir: &Path) -> Result<Vec<String>, SyncError> {
        let node_id = crate::graph::node_id(node).unwrap_or_default();
        let mut created = Vec::new();
        write_if_nonempty(
            node_dir,
            &format!("{node_id}.js"),
            string_field(node, "func"),
            &mut created,
        )?;
        write_if_nonempty(
            node_dir,
            &format!("{node_id}.initialize.js"),
            string_field(node, "initialize"),
            &mut created,
        )?;
        write_if_nonempty(
            node_dir,
            &format!("{node_id}.finalize.js"),
            string_field(node, "finalize"),
            &mut created,
        )?;
        Ok(created)
    }

    fn rebuild_node(
        &self,
        node_id: &str,
        node_dir: &Path,
        merged: &Node,
    ) -> Result<Node, SyncError> {
        let mut data = Map::new();

        let js_file = node_dir.join(format!("{node_id}.js"));
        if js_file.exists() {
            data.insert("func".to_string(), std::fs::read_to_string(js_file)?.into());
        }

        // initialize/finalize: a missing file with the field present in the
        // skeleton means the field was empty; keep its position with "".
        for field in ["initialize", "finalize"] {
            let file = node_dir.join(format!("{node_id}.{field}.js"));
            if file.exists() {
                data.insert(field.to_string(), std::fs::read_to_string(file)?.into());
            } else if merged.contains_key(field) {
                data.insert(field.to_string(), Value::String(String::new()));
            }
        }

        Ok(data)
    }

    fn infer_node_type(&self, node_dir: &Path, node_id: &str) -> Option<&'static str> {
        node_dir
            .join(format!("{node_id}.js"))
            .exists()
            .then_some("function")
    }
}
