//! Tree reconciliation: orphaned-file detection and new-file handling.
//!
//! After an explode, any file the skeleton metadata does not account for is
//! orphaned. Before a rebuild, any node definition file without a skeleton
//! entry is new and is either synthesized into a node, moved aside, or
//! deleted.

use crate::error::SyncError;
use crate::extract::Registry;
use crate::graph::{self, Node};
use crate::skeleton::{self, ORPHAN_DIRNAME, SKELETON_FILENAME};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// What to do with node definition files that have no skeleton entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewFileMode {
    /// Synthesize new nodes from the files (default).
    #[default]
    Create,
    /// Move the files into the orphan subtree.
    Orphan,
    /// Delete the files along with their sibling artifacts.
    Delete,
}

fn in_orphan_subtree(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == std::ffi::OsStr::new(ORPHAN_DIRNAME))
}

fn walk_files(src_dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(src_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !in_orphan_subtree(path))
        .filter(|path| {
            path.file_name()
                .is_none_or(|n| n != std::ffi::OsStr::new(SKELETON_FILENAME))
        })
}

/// Find files the skeleton metadata does not account for.
///
/// The expected set is the union, over all skeleton entries, of the node's
/// resolved directory crossed with the filenames recorded in its
/// `_explode_meta`. Everything else on disk (outside the orphan subtree and
/// the skeleton file) is orphaned.
pub fn find_orphaned(
    src_dir: &Path,
    entries: &[Node],
    containers: &HashSet<String>,
) -> Result<Vec<PathBuf>, SyncError> {
    let mut expected: HashSet<PathBuf> = HashSet::new();
    for entry in entries {
        if graph::node_id(entry).is_none() {
            continue;
        }
        let node_dir = skeleton::node_directory(entry, src_dir, containers);
        for (_, files) in skeleton::meta_files(entry) {
            for filename in files {
                expected.insert(node_dir.join(filename));
            }
        }
    }

    Ok(walk_files(src_dir)
        .filter(|path| !expected.contains(path))
        .collect())
}

/// Heuristic orphan detection for trees without skeleton metadata: a file's
/// id stem must match a known node id and the file must live in that node's
/// expected directory.
pub fn find_orphaned_heuristic(
    src_dir: &Path,
    document: &[Node],
    containers: &HashSet<String>,
) -> Result<Vec<PathBuf>, SyncError> {
    let mut node_dirs: HashMap<String, PathBuf> = HashMap::new();
    for node in document {
        if let Some(id) = graph::node_id(node) {
            node_dirs.insert(
                id.to_string(),
                skeleton::node_directory(node, src_dir, containers),
            );
        }
    }

    Ok(walk_files(src_dir)
        .filter(|path| {
            let stem = path
                .file_name()
                .map(|n| n.to_string_lossy())
                .map(|name| name.split('.').next().unwrap_or("").to_string())
                .unwrap_or_default();
            match node_dirs.get(&stem) {
                None => true,
                Some(expected_dir) => path.parent() != Some(expected_dir.as_path()),
            }
        })
        .collect())
}

/// Move orphans into `.orphaned/` (preserving relative paths, timestamped
/// on collision) or delete them. Every path is logged before action.
pub fn handle_orphaned(
    orphaned: &[PathBuf],
    src_dir: &Path,
    delete: bool,
) -> Result<(), SyncError> {
    if orphaned.is_empty() {
        return Ok(());
    }

    warn!("Found {} orphaned file(s):", orphaned.len());
    for path in orphaned {
        let rel = path.strip_prefix(src_dir).unwrap_or(path);
        warn!("  - {}", rel.display());
    }

    if delete {
        info!("Deleting orphaned files...");
        for path in orphaned {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }

    let orphan_dir = src_dir.join(ORPHAN_DIRNAME);
    info!("Moving orphaned files to {ORPHAN_DIRNAME}/...");
    for path in orphaned {
        let rel = path.strip_prefix(src_dir).unwrap_or(path);
        let mut dest = orphan_dir.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let stem = dest
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let suffix = dest
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            dest = dest.with_file_name(format!("{stem}.{stamp}{suffix}"));
        }
        std::fs::rename(path, &dest)?;
    }
    info!("Moved {} orphaned file(s) to {ORPHAN_DIRNAME}/", orphaned.len());
    Ok(())
}

/// Find node definition files (`*.json`) with no skeleton entry, ignoring
/// files an extractor identifies as its own secondary artifacts.
pub fn find_new_files(
    src_dir: &Path,
    entries: &[Node],
    registry: &Registry,
) -> Result<Vec<PathBuf>, SyncError> {
    let known_ids: HashSet<&str> = entries.iter().filter_map(graph::node_id).collect();

    Ok(walk_files(src_dir)
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            !registry.is_metadata_file(&name)
        })
        .filter(|path| {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            !known_ids.contains(stem.as_str())
        })
        .collect())
}

/// Starting position for synthesized nodes; subsequent nodes stack
/// vertically below it.
const NEW_NODE_ORIGIN: (i64, i64) = (100, 100);
const NEW_NODE_STEP: i64 = 50;

/// Create a node from a new definition file with inferred defaults.
fn synthesize_node(
    json_file: &Path,
    position: (i64, i64),
    src_dir: &Path,
    registry: &Registry,
    containers: &HashSet<String>,
) -> Result<Node, SyncError> {
    skeleton::ensure_within(src_dir, json_file)?;

    let text = std::fs::read_to_string(json_file)?;
    let value: Value = serde_json::from_str(&text)?;
    let Value::Object(mut node) = value else {
        return Err(SyncError::InvalidDocument(format!(
            "{} is not a node object",
            json_file.display()
        )));
    };

    let stem = json_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if !node.contains_key("id") {
        node.insert("id".to_string(), Value::from(stem.clone()));
    }

    // Container inferred from the directory when it names a known tab or
    // subflow id.
    if !node.contains_key("z") {
        if let Some(parent_name) = json_file
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
        {
            if containers.contains(&parent_name) {
                node.insert("z".to_string(), Value::from(parent_name));
            }
        }
    }

    if !node.contains_key("x") {
        node.insert("x".to_string(), Value::from(position.0));
    }
    if !node.contains_key("y") {
        node.insert("y".to_string(), Value::from(position.1));
    }

    if !node.contains_key("wires") {
        let outputs = node.get("outputs").and_then(Value::as_u64).unwrap_or(1) as usize;
        let wires: Vec<Value> = (0..outputs).map(|_| Value::Array(Vec::new())).collect();
        node.insert("wires".to_string(), Value::Array(wires));
    }

    if !node.contains_key("type") {
        let node_dir = json_file.parent().unwrap_or(src_dir);
        let node_type = registry
            .infer_node_type(node_dir, &stem)
            .unwrap_or("comment");
        node.insert("type".to_string(), Value::from(node_type));
    }

    Ok(node)
}

/// Handle new files per mode. Returns synthesized nodes (empty for
/// orphan/delete modes).
pub fn handle_new_files(
    new_files: &[PathBuf],
    src_dir: &Path,
    registry: &Registry,
    mode: NewFileMode,
    containers: &HashSet<String>,
) -> Result<Vec<Node>, SyncError> {
    if new_files.is_empty() {
        return Ok(Vec::new());
    }

    warn!("Found {} new file(s) not in skeleton:", new_files.len());
    for path in new_files {
        let rel = path.strip_prefix(src_dir).unwrap_or(path);
        warn!("  - {}", rel.display());
    }

    match mode {
        NewFileMode::Delete => {
            info!("Deleting new files...");
            for path in new_files {
                delete_node_artifacts(path)?;
            }
            Ok(Vec::new())
        }
        NewFileMode::Orphan => {
            handle_orphaned(new_files, src_dir, false)?;
            Ok(Vec::new())
        }
        NewFileMode::Create => {
            info!("Creating nodes from new files...");
            let mut nodes = Vec::new();
            let mut position = NEW_NODE_ORIGIN;
            for json_file in new_files {
                match synthesize_node(json_file, position, src_dir, registry, containers) {
                    Ok(node) => {
                        info!(
                            "  Created node: {} (type: {})",
                            graph::node_id(&node).unwrap_or("?"),
                            graph::node_type(&node)
                        );
                        nodes.push(node);
                        position.1 += NEW_NODE_STEP;
                    }
                    Err(e) => {
                        warn!(
                            "  Failed to create node from {}: {e}",
                            json_file.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                        );
                    }
                }
            }
            Ok(nodes)
        }
    }
}

/// Delete a node's definition file and every sibling sharing its id stem.
fn delete_node_artifacts(json_file: &Path) -> Result<(), SyncError> {
    let Some(parent) = json_file.parent() else {
        return Ok(());
    };
    let Some(stem) = json_file.file_stem().map(|s| s.to_string_lossy().to_string()) else {
        return Ok(());
    };
    let prefix = format!("{stem}.");
    for entry in std::fs::read_dir(parent)?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && entry.path().is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
