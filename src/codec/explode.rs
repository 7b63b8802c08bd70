//! Explode pass: flows document -> skeleton + per-node files, with
//! per-node round-trip verification.

use super::{rebuild_single_node, run_batch, CodecOptions};
use crate::error::SyncError;
use crate::extract::Registry;
use crate::graph::{self, Node};
use crate::skeleton::{self, BASE_META_KEY, META_KEY};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Result of [`explode_document`].
pub struct ExplodeOutcome {
    /// Skeleton entries in document order, metadata attached.
    pub skeleton: Vec<Node>,
    /// True when any node failed round-trip verification.
    pub any_unstable: bool,
}

/// Explode a document into `src_dir` and write the skeleton file.
///
/// Per-node failures degrade to `stable=false` plus a warning; the batch
/// never aborts because of a single node.
pub async fn explode_document(
    document: &[Node],
    registry: &Arc<Registry>,
    src_dir: &Path,
    options: &CodecOptions,
) -> Result<ExplodeOutcome, SyncError> {
    std::fs::create_dir_all(src_dir)?;

    let containers = Arc::new(graph::container_ids(document));
    for id in containers.iter() {
        std::fs::create_dir_all(src_dir.join(id))?;
    }

    let jobs: Vec<_> = document
        .iter()
        .cloned()
        .map(|node| {
            let registry = Arc::clone(registry);
            let src_dir = src_dir.to_path_buf();
            let containers = Arc::clone(&containers);
            move || explode_single_node(node, &registry, &src_dir, &containers)
        })
        .collect();

    let slots = run_batch(jobs, options, "explode").await;

    let mut entries = Vec::with_capacity(slots.len());
    let mut any_unstable = false;
    for slot in slots.into_iter().flatten() {
        let (entry, unstable) = slot;
        if let Some(entry) = entry {
            entries.push(entry);
        }
        any_unstable |= unstable;
    }

    skeleton::save_skeleton(src_dir, &entries)?;

    Ok(ExplodeOutcome {
        skeleton: entries,
        any_unstable,
    })
}

/// Explode one node: run extractors with claim tracking, write the base
/// file, blank the skeleton, verify the round trip.
fn explode_single_node(
    node: Node,
    registry: &Registry,
    src_dir: &Path,
    containers: &HashSet<String>,
) -> (Option<Node>, bool) {
    let Some(node_id) = graph::node_id(&node).map(str::to_string) else {
        warn!("Skipping node without an id");
        return (None, false);
    };

    let node_dir = skeleton::node_directory(&node, src_dir, containers);
    if let Err(e) = std::fs::create_dir_all(&node_dir) {
        warn!("Cannot create directory for node {node_id}: {e}");
        return (None, true);
    }

    let mut entry = skeleton::create_skeleton(&node);
    let mut claimed: HashSet<String> = HashSet::new();
    let mut files_map = Map::new();
    let mut extract_failed = false;

    for extractor in registry.extractors() {
        if !extractor.can_handle(&node) {
            continue;
        }
        let fields: HashSet<String> = extractor.claimed_fields(&node).into_iter().collect();
        if !fields.is_disjoint(&claimed) {
            // Another extractor already owns some of these fields; this one
            // is skipped entirely, never partially applied.
            continue;
        }
        claimed.extend(fields);
        match extractor.explode_node(&node, &node_dir) {
            Ok(files) if !files.is_empty() => {
                let mut files = files;
                files.sort();
                files_map.insert(
                    extractor.name().to_string(),
                    Value::Array(files.into_iter().map(Value::from).collect()),
                );
            }
            Ok(_) => {}
            Err(e) => {
                let err = SyncError::Extractor {
                    name: extractor.name().to_string(),
                    reason: e.to_string(),
                };
                warn!("{err} (exploding node {node_id})");
                extract_failed = true;
            }
        }
    }

    // Remaining functional fields go to the node-local base file.
    let base_fields: Map<String, Value> = node
        .iter()
        .filter(|(field, _)| !graph::is_structural(field.as_str()) && !claimed.contains(field.as_str()))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();
    if !base_fields.is_empty() {
        let filename = format!("{node_id}.json");
        let mut text = match serde_json::to_string(&base_fields) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot serialize base fields for node {node_id}: {e}");
                return (None, true);
            }
        };
        text.push('\n');
        if let Err(e) = std::fs::write(node_dir.join(&filename), text) {
            warn!("Cannot write base file for node {node_id}: {e}");
            return (None, true);
        }
        files_map.insert(
            BASE_META_KEY.to_string(),
            Value::Array(vec![Value::from(filename)]),
        );
    }

    // Round-trip verification: rebuild from what just hit the disk and
    // compare serializations (metadata excluded).
    let (stable, unstable) = if extract_failed {
        (Some(false), true)
    } else {
        match rebuild_single_node(&entry, &node_dir, registry) {
            Ok(rebuilt) => {
                let original = graph::node_to_compact_json(&node, &[META_KEY]);
                let roundtrip = graph::node_to_compact_json(&rebuilt, &[META_KEY]);
                if original == roundtrip {
                    (Some(true), false)
                } else {
                    warn!("Node {node_id} changed during round-trip - will trigger rebuild and upload");
                    (Some(false), true)
                }
            }
            Err(e) => {
                warn!("Failed to verify node {node_id}: {e}");
                (Some(false), true)
            }
        }
    };

    skeleton::set_meta(&mut entry, files_map, stable);
    (Some(entry), unstable)
}
