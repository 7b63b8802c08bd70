//! Template extractor: the `template` field of template-family nodes to a
//! file with an IDE-friendly extension.
//!
//! - `ui_template` (dashboard 2) -> `.vue`
//! - `ui-template` (dashboard 1) -> `.ui-template.html`
//! - `template` (core) -> `.template.<ext>` chosen from the node's `format`

use super::Extractor;
use crate::error::SyncError;
use crate::graph::{self, Node};
use serde_json::{Map, Value};
use std::path::Path;

pub struct TemplateExtractor;

const TEMPLATE_TYPES: [&str; 3] = ["template", "ui_template", "ui-template"];

fn format_extension(format: &str) -> &'static str {
    match format {
        "handlebars" => ".mustache",
        "html" => ".html",
        "json" => ".json",
        "yaml" => ".yaml",
        "javascript" => ".js",
        "css" => ".css",
        "markdown" => ".md",
        "python" => ".py",
        "sql" => ".sql",
        "c_cpp" => ".cpp",
        "java" => ".java",
        "text" => ".txt",
        _ => ".txt",
    }
}

/// Full filename suffix for a node's template file, from type and format.
fn template_suffix(node: &Node) -> String {
    match graph::node_type(node) {
        "ui_template" => ".vue".to_string(),
        "ui-template" => ".ui-template.html".to_string(),
        "template" => {
            let format = node
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("handlebars");
            format!(".template{}", format_extension(format))
        }
        _ => ".template.txt".to_string(),
    }
}

/// Locate an existing template file for a node, trying the computed name
/// first and falling back to pattern matches.
fn find_template_file(node_dir: &Path, node_id: &str, merged: &Node) -> Option<std::path::PathBuf> {
    let computed = node_dir.join(format!("{node_id}{}", template_suffix(merged)));
    if computed.exists() {
        return Some(computed);
    }
    let entries = std::fs::read_dir(node_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let matches = name == format!("{node_id}.vue")
            || name == format!("{node_id}.ui-template.html")
            || (name.starts_with(&format!("{node_id}.template.")) && entry.path().is_file());
        if matches {
            return Some(entry.path());
        }
    }
    None
}

impl Extractor for TemplateExtractor {
    fn name(&self) -> &'static str {
        "template"
    }

    fn priority(&self) -> u32 {
        240
    }

    fn can_handle(&self, node: &Node) -> bool {
        TEMPLATE_TYPES.contains(&graph::node_type(node)) && node.contains_key("template")
    }

    fn claimed_fields(&self, _node: &Node) -> Vec<String> {
        vec!["template".to_string()]
    }

    fn explode_node(&self, node: &Node, node_dir: &Path) -> Result<Vec<String>, SyncError> {
        let node_id = graph::node_id(node).unwrap_or_default();
        let content = node.get("template").and_then(Value::as_str).unwrap_or("");
        if content.is_empty() {
            return Ok(Vec::new());
        }
        let filename = format!("{node_id}{}", template_suffix(node));
        std::fs::write(node_dir.join(&filename), content)?;
        Ok(vec![filename])
    }

    fn rebuild_node(
        &self,
        node_id: &str,
        node_dir: &Path,
        merged: &Node,
    ) -> Result<Node, SyncError> {
        let mut data = Map::new();
        if let Some(file) = find_template_file(node_dir, node_id, merged) {
            data.insert(
                "template".to_string(),
                std::fs::read_to_string(file)?.into(),
            );
        } else if merged.contains_key("template") {
            data.insert("template".to_string(), Value::String(String::new()));
        }
        Ok(data)
    }

    fn is_metadata_file(&self, filename: &str) -> bool {
        filename.ends_with(".vue")
            || filename.ends_with(".ui-template.html")
            || filename.contains(".template.")
    }

    fn infer_node_type(&self, node_dir: &Path, node_id: &str) -> Option<&'static str> {
        if node_dir.join(format!("{node_id}.vue")).exists() {
            return Some("ui_template");
        }
        if node_dir.join(format!("{node_id}.ui-template.html")).exists() {
            return Some("ui-template");
        }
        let prefix = format!("{node_id}.template.");
        let found = std::fs::read_dir(node_dir).ok()?.flatten().any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(prefix.as_str())
        });
        found.then_some("template")
    }
}
