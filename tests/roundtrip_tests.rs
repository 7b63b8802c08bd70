//! Integration tests for the explode/rebuild codec.

use flowsync::codec::{explode_document, rebuild_document, CodecOptions};
use flowsync::config::ExtractorSettings;
use flowsync::extract::{Extractor, Registry};
use flowsync::graph::{self, Node};
use flowsync::skeleton;
use flowsync::SyncError;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn nodes_from(value: Value) -> Vec<Node> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map,
                _ => panic!("expected node object"),
            })
            .collect(),
        _ => panic!("expected array"),
    }
}

/// A small wired flow: inject -> function -> debug on one tab.
fn sample_flow() -> Vec<Node> {
    nodes_from(json!([
        {"id": "t1", "type": "tab", "label": "Flow 1"},
        {"id": "n1", "type": "inject", "z": "t1", "name": "tick",
         "props": [{"p": "payload"}], "repeat": "", "once": false,
         "x": 110, "y": 80, "wires": [["n2"]]},
        {"id": "n2", "type": "function", "z": "t1", "name": "double",
         "func": "msg.payload *= 2;\nreturn msg;", "outputs": 1,
         "initialize": "", "finalize": "", "info": "Doubles the payload.",
         "x": 260, "y": 80, "wires": [["n3"]]},
        {"id": "n3", "type": "debug", "z": "t1", "name": "out",
         "active": true, "complete": "payload",
         "x": 410, "y": 80, "wires": []}
    ]))
}

fn default_registry() -> Arc<Registry> {
    Arc::new(Registry::builtin(&ExtractorSettings::default()))
}

/// Rebuild(Explode(g)) == g as byte-identical serialization.
#[tokio::test]
async fn round_trip_is_byte_identical() {
    let tree = TempDir::new().unwrap();
    let registry = default_registry();
    let document = sample_flow();

    let outcome = explode_document(&document, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();
    assert!(!outcome.any_unstable, "all nodes should verify as stable");
    for entry in &outcome.skeleton {
        assert_eq!(skeleton::entry_stable(entry), Some(true));
    }

    // Extracted artifacts land in the tab directory.
    assert!(tree.path().join("t1/n2.js").exists());
    assert!(tree.path().join("t1/n2.md").exists());
    assert!(tree.path().join(skeleton::SKELETON_FILENAME).exists());

    let entries = skeleton::load_skeleton(tree.path(), None).unwrap();
    let rebuilt = rebuild_document(&entries, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();

    assert_eq!(
        graph::to_compact_json(&document),
        graph::to_compact_json(&rebuilt)
    );
}

/// The skeleton blanks functional fields but keeps structure and order.
#[tokio::test]
async fn skeleton_preserves_structure_and_blanks_content() {
    let tree = TempDir::new().unwrap();
    let registry = default_registry();
    let document = sample_flow();

    let outcome = explode_document(&document, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();

    let function_entry = outcome
        .skeleton
        .iter()
        .find(|e| graph::node_id(e) == Some("n2"))
        .unwrap();
    assert_eq!(function_entry["func"], json!(""));
    assert_eq!(function_entry["info"], json!(""));
    assert_eq!(function_entry["outputs"], json!(0));
    assert_eq!(function_entry["wires"], json!([["n3"]]));

    let original_keys: Vec<&String> = document[2].keys().collect();
    let entry_keys: Vec<&String> = function_entry
        .keys()
        .filter(|k| k.as_str() != skeleton::META_KEY)
        .collect();
    assert_eq!(original_keys, entry_keys);
}

/// Per-node verification flags a node whose round trip cannot reproduce
/// the original, without aborting the batch.
#[tokio::test]
async fn unstable_node_is_flagged_and_batch_continues() {
    let tree = TempDir::new().unwrap();
    let registry = default_registry();
    // A null info field cannot survive the info extractor's round trip
    // (it rebuilds as an empty string), so the node is unstable.
    let mut document = sample_flow();
    document.push(
        nodes_from(json!([{"id": "n4", "type": "debug", "z": "t1", "info": null,
                           "x": 500, "y": 80, "wires": []}]))
        .remove(0),
    );

    let outcome = explode_document(&document, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();

    assert!(outcome.any_unstable);
    let unstable = outcome
        .skeleton
        .iter()
        .find(|e| graph::node_id(e) == Some("n4"))
        .unwrap();
    assert_eq!(skeleton::entry_stable(unstable), Some(false));
    // The rest of the batch still verified.
    let stable = outcome
        .skeleton
        .iter()
        .find(|e| graph::node_id(e) == Some("n2"))
        .unwrap();
    assert_eq!(skeleton::entry_stable(stable), Some(true));
}

struct ClaimingExtractor {
    name: &'static str,
    priority: u32,
    rebuild_value: &'static str,
}

impl Extractor for ClaimingExtractor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_handle(&self, node: &Node) -> bool {
        node.contains_key("body")
    }

    fn claimed_fields(&self, _node: &Node) -> Vec<String> {
        vec!["body".to_string()]
    }

    fn explode_node(&self, node: &Node, node_dir: &Path) -> Result<Vec<String>, SyncError> {
        let id = graph::node_id(node).unwrap_or_default();
        let body = node.get("body").and_then(Value::as_str).unwrap_or("");
        let filename = format!("{id}.{}.txt", self.name);
        std::fs::write(node_dir.join(&filename), body)?;
        Ok(vec![filename])
    }

    fn rebuild_node(
        &self,
        node_id: &str,
        node_dir: &Path,
        _merged: &Node,
    ) -> Result<Node, SyncError> {
        let mut data = Map::new();
        let file = node_dir.join(format!("{node_id}.{}.txt", self.name));
        if file.exists() {
            data.insert("body".to_string(), std::fs::read_to_string(file)?.into());
        } else {
            // Distinguishable output: if this extractor ran without its
            // file, the claim-exclusivity check failed upstream.
            data.insert("body".to_string(), Value::from(self.rebuild_value));
        }
        Ok(data)
    }
}

/// Two extractors claiming the same field: only the higher-priority one is
/// applied; the other is skipped entirely, not partially.
#[tokio::test]
async fn overlapping_claims_skip_the_later_extractor() {
    let tree = TempDir::new().unwrap();
    let registry: Arc<Registry> = Arc::new(Registry::with_extractors(vec![
        Arc::new(ClaimingExtractor {
            name: "alpha",
            priority: 10,
            rebuild_value: "FROM-ALPHA-FALLBACK",
        }),
        Arc::new(ClaimingExtractor {
            name: "beta",
            priority: 20,
            rebuild_value: "FROM-BETA",
        }),
    ]));

    let document = nodes_from(json!([
        {"id": "c1", "type": "custom", "body": "the payload", "x": 1, "y": 2, "wires": []}
    ]));

    let outcome = explode_document(&document, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();
    assert!(!outcome.any_unstable);

    // Only alpha produced a file; beta was skipped at explode time.
    assert!(tree.path().join("c1.alpha.txt").exists());
    assert!(!tree.path().join("c1.beta.txt").exists());

    let entry = &outcome.skeleton[0];
    let recorded: Vec<String> = skeleton::meta_files(entry)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(recorded.contains(&"alpha".to_string()));
    assert!(!recorded.contains(&"beta".to_string()));

    let rebuilt = rebuild_document(&outcome.skeleton, &registry, tree.path(), &CodecOptions::default())
        .await
        .unwrap();
    assert_eq!(rebuilt[0]["body"], json!("the payload"));
}

/// Batches over the parallel threshold produce the same deterministic
/// output order as sequential processing.
#[tokio::test]
async fn parallel_explode_is_order_deterministic() {
    let registry = default_registry();
    let mut document = vec![nodes_from(json!([{"id": "t1", "type": "tab"}])).remove(0)];
    for i in 0..40 {
        document.push(
            nodes_from(json!([{
                "id": format!("f{i}"), "type": "function", "z": "t1",
                "name": format!("fn {i}"), "func": format!("return {i};"),
                "x": 100, "y": 100 + i * 30, "wires": []
            }]))
            .remove(0),
        );
    }

    let parallel_tree = TempDir::new().unwrap();
    let parallel = explode_document(
        &document,
        &registry,
        parallel_tree.path(),
        &CodecOptions {
            max_workers: Some(4),
            parallel: true,
        },
    )
    .await
    .unwrap();

    let sequential_tree = TempDir::new().unwrap();
    let sequential = explode_document(
        &document,
        &registry,
        sequential_tree.path(),
        &CodecOptions {
            max_workers: None,
            parallel: false,
        },
    )
    .await
    .unwrap();

    let parallel_ids: Vec<&str> = parallel.skeleton.iter().filter_map(graph::node_id).collect();
    let sequential_ids: Vec<&str> = sequential
        .skeleton
        .iter()
        .filter_map(graph::node_id)
        .collect();
    assert_eq!(parallel_ids, sequential_ids);

    let rebuilt = rebuild_document(
        &parallel.skeleton,
        &registry,
        parallel_tree.path(),
        &CodecOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(
        graph::to_compact_json(&document),
        graph::to_compact_json(&rebuilt)
    );
}
