//! Rebuild pass: skeleton + per-node files -> flows document.

use super::{run_batch, CodecOptions};
use crate::error::SyncError;
use crate::extract::Registry;
use crate::graph::{self, Node};
use crate::skeleton::{self, META_KEY};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Rebuild one node from its skeleton entry and on-disk files.
///
/// Starts from the skeleton (which preserves field order and shape), merges
/// base-file fields, then lets each extractor contribute its claimed fields
/// in priority order. An extractor whose claim intersects fields already
/// merged by an earlier extractor is skipped entirely; returned fields
/// outside the declared claim are dropped. Extractor errors degrade to a
/// warning so one bad file cannot take down the batch.
pub fn rebuild_single_node(
    entry: &Node,
    node_dir: &Path,
    registry: &Registry,
) -> Result<Node, SyncError> {
    let node_id = graph::node_id(entry)
        .ok_or_else(|| SyncError::InvalidDocument("skeleton entry without an id".to_string()))?
        .to_string();

    // shift_remove keeps field order intact even when the metadata key is
    // not the last entry (e.g. a hand-edited skeleton).
    let mut merged = entry.clone();
    merged.shift_remove(META_KEY);

    let base_file = node_dir.join(format!("{node_id}.json"));
    if base_file.exists() {
        let text = std::fs::read_to_string(&base_file)?;
        let value: Value = serde_json::from_str(&text)?;
        let Value::Object(base_fields) = value else {
            return Err(SyncError::InvalidDocument(format!(
                "base file for node {node_id} is not an object"
            )));
        };
        for (field, value) in base_fields {
            merged.insert(field, value);
        }
    }

    let mut claimed: HashSet<String> = HashSet::new();
    for extractor in registry.extractors() {
        // Not gated on can_handle: the skeleton carries placeholders, so
        // matching is driven by what exists on disk and in the entry.
        let data = match extractor.rebuild_node(&node_id, node_dir, &merged) {
            Ok(data) => data,
            Err(e) => {
                let err = SyncError::Extractor {
                    name: extractor.name().to_string(),
                    reason: e.to_string(),
                };
                warn!("{err} (rebuilding node {node_id})");
                continue;
            }
        };
        if data.is_empty() {
            continue;
        }
        let fields: HashSet<String> = extractor.claimed_fields(&merged).into_iter().collect();
        if !fields.is_disjoint(&claimed) {
            continue;
        }
        for (field, value) in data {
            if fields.contains(&field) {
                merged.insert(field, value);
            }
        }
        claimed.extend(fields);
    }

    Ok(merged)
}

/// Rebuild all nodes from skeleton entries, preserving entry order.
pub async fn rebuild_document(
    entries: &[Node],
    registry: &Arc<Registry>,
    src_dir: &Path,
    options: &CodecOptions,
) -> Result<Vec<Node>, SyncError> {
    let containers = Arc::new(graph::container_ids(entries));

    let jobs: Vec<_> = entries
        .iter()
        .cloned()
        .map(|entry| {
            let registry = Arc::clone(registry);
            let src_dir = src_dir.to_path_buf();
            let containers = Arc::clone(&containers);
            move || {
                let node_dir = skeleton::node_directory(&entry, &src_dir, &containers);
                match rebuild_single_node(&entry, &node_dir, &registry) {
                    Ok(node) => node,
                    Err(e) => {
                        // Degrade to the bare skeleton so the document keeps
                        // its shape; the next explode will flag instability.
                        warn!(
                            "Rebuild failed for node {}: {e}",
                            graph::node_id(&entry).unwrap_or("<missing id>")
                        );
                        let mut fallback = entry.clone();
                        fallback.shift_remove(META_KEY);
                        fallback
                    }
                }
            }
        })
        .collect();

    let slots = run_batch(jobs, options, "rebuild").await;
    Ok(slots.into_iter().flatten().collect())
}
