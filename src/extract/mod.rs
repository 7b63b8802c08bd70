//! Extraction contract and registry.
//!
//! Extractors own specific functional fields of specific node types and
//! turn them into editable files (and back). Stages transform the whole
//! document or the exploded tree around the codec passes. All extension
//! points are typed traits; the registry is populated from named factories
//! at startup so a reload reconstructs entries instead of mutating live
//! ones.

mod func;
mod info;
mod template;

pub use func::FuncExtractor;
pub use info::InfoExtractor;
pub use template::TemplateExtractor;

use crate::config::ExtractorSettings;
use crate::error::SyncError;
use crate::graph::Node;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A field extractor: explodes claimed fields of matching nodes into files
/// and rebuilds them from those files.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priority runs first. Ties break alphabetically by name.
    fn priority(&self) -> u32;

    /// Whether this extractor will actually process the node.
    fn can_handle(&self, node: &Node) -> bool;

    /// Fields this extractor owns on the node. Only consulted when
    /// `can_handle` returned true.
    fn claimed_fields(&self, node: &Node) -> Vec<String>;

    /// Write node-specific files into `node_dir`. Returns the created
    /// filenames (relative to `node_dir`).
    fn explode_node(&self, node: &Node, node_dir: &Path) -> Result<Vec<String>, SyncError>;

    /// Rebuild claimed fields from files. `merged` is the skeleton entry
    /// with base-file fields already applied; only returned fields inside
    /// the declared claim are merged by the codec.
    fn rebuild_node(&self, node_id: &str, node_dir: &Path, merged: &Node)
        -> Result<Node, SyncError>;

    /// Whether `filename` is a secondary artifact of this extractor rather
    /// than a primary node definition (consulted during new-file scans).
    fn is_metadata_file(&self, _filename: &str) -> bool {
        false
    }

    /// Infer a node type from files on disk, for nodes synthesized from
    /// new files.
    fn infer_node_type(&self, _node_dir: &Path, _node_id: &str) -> Option<&'static str> {
        None
    }
}

/// A document-level transform run before explode or after rebuild.
pub trait DocumentStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u32;
    fn process(&self, document: Vec<Node>) -> Result<Vec<Node>, SyncError>;
}

/// A tree-level transform run after explode or before rebuild.
/// Returns whether any file was modified.
pub trait TreeStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u32;
    fn process(&self, src_dir: &Path) -> Result<bool, SyncError>;
}

/// Factory producing a fresh extractor instance; the registry keeps these
/// so reload can reconstruct the active set.
pub type ExtractorFactory = fn() -> Arc<dyn Extractor>;

fn builtin_factories() -> Vec<(&'static str, ExtractorFactory)> {
    vec![
        ("func", || Arc::new(FuncExtractor)),
        ("template", || Arc::new(TemplateExtractor)),
        ("info", || Arc::new(InfoExtractor)),
    ]
}

/// Active extension points, ordered and filtered per configuration.
pub struct Registry {
    factories: Vec<(&'static str, ExtractorFactory)>,
    extractors: Vec<Arc<dyn Extractor>>,
    pre_explode: Vec<Arc<dyn DocumentStage>>,
    post_explode: Vec<Arc<dyn TreeStage>>,
    pre_rebuild: Vec<Arc<dyn TreeStage>>,
    post_rebuild: Vec<Arc<dyn DocumentStage>>,
}

impl Registry {
    /// Build a registry with the built-in extractors, applying the
    /// enable/disable/order settings.
    pub fn builtin(settings: &ExtractorSettings) -> Self {
        let mut registry = Registry {
            factories: builtin_factories(),
            extractors: Vec::new(),
            pre_explode: Vec::new(),
            post_explode: Vec::new(),
            pre_rebuild: Vec::new(),
            post_rebuild: Vec::new(),
        };
        registry.activate(settings);
        registry
    }

    /// Construct an empty registry and register extractors explicitly.
    /// Used by tests and by external callers wiring their own set.
    pub fn with_extractors(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        let mut registry = Registry {
            factories: Vec::new(),
            extractors,
            pre_explode: Vec::new(),
            post_explode: Vec::new(),
            pre_rebuild: Vec::new(),
            post_rebuild: Vec::new(),
        };
        registry.sort_extractors(&ExtractorSettings::default());
        registry
    }

    pub fn register_factory(&mut self, name: &'static str, factory: ExtractorFactory) {
        self.factories.retain(|(existing, _)| *existing != name);
        self.factories.push((name, factory));
    }

    pub fn register_pre_explode(&mut self, stage: Arc<dyn DocumentStage>) {
        self.pre_explode.push(stage);
        self.pre_explode.sort_by_key(|s| (s.priority(), s.name()));
    }

    pub fn register_post_explode(&mut self, stage: Arc<dyn TreeStage>) {
        self.post_explode.push(stage);
        self.post_explode.sort_by_key(|s| (s.priority(), s.name()));
    }

    pub fn register_pre_rebuild(&mut self, stage: Arc<dyn TreeStage>) {
        self.pre_rebuild.push(stage);
        self.pre_rebuild.sort_by_key(|s| (s.priority(), s.name()));
    }

    pub fn register_post_rebuild(&mut self, stage: Arc<dyn DocumentStage>) {
        self.post_rebuild.push(stage);
        self.post_rebuild.sort_by_key(|s| (s.priority(), s.name()));
    }

    /// Build a replacement registry from this one's factories and stages,
    /// with fresh extractor instances under the given settings.
    pub fn reload(&self, settings: &ExtractorSettings) -> Registry {
        let mut next = Registry {
            factories: self.factories.clone(),
            extractors: Vec::new(),
            pre_explode: self.pre_explode.clone(),
            post_explode: self.post_explode.clone(),
            pre_rebuild: self.pre_rebuild.clone(),
            post_rebuild: self.post_rebuild.clone(),
        };
        next.activate(settings);
        next
    }

    /// Reconstruct the active extractor set from factories. This is the
    /// reload path: fresh instances, current settings.
    pub fn activate(&mut self, settings: &ExtractorSettings) {
        self.extractors = self
            .factories
            .iter()
            .filter(|(name, _)| !settings.disabled.iter().any(|d| d == name))
            .map(|(_, factory)| factory())
            .collect();
        self.sort_extractors(settings);
        info!(
            "Activated {} extractor(s): {}",
            self.extractors.len(),
            self.extractors
                .iter()
                .map(|e| e.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    fn sort_extractors(&mut self, settings: &ExtractorSettings) {
        // Explicit configuration order wins; everything else follows by
        // (priority, name). The alphabetical tie-break is contractual.
        let order = &settings.order;
        self.extractors.sort_by_key(|extractor| {
            let explicit = order.iter().position(|n| n == extractor.name());
            match explicit {
                Some(index) => (0usize, index, 0u32, extractor.name()),
                None => (1usize, 0, extractor.priority(), extractor.name()),
            }
        });
    }

    pub fn extractors(&self) -> &[Arc<dyn Extractor>] {
        &self.extractors
    }

    /// Whether any extractor identifies `filename` as a secondary artifact.
    pub fn is_metadata_file(&self, filename: &str) -> bool {
        self.extractors.iter().any(|e| e.is_metadata_file(filename))
    }

    /// Ask extractors to infer a node type from files on disk.
    pub fn infer_node_type(&self, node_dir: &Path, node_id: &str) -> Option<&'static str> {
        self.extractors
            .iter()
            .find_map(|e| e.infer_node_type(node_dir, node_id))
    }

    pub fn run_pre_explode(&self, mut document: Vec<Node>) -> Result<Vec<Node>, SyncError> {
        for stage in &self.pre_explode {
            document = stage.process(document)?;
        }
        Ok(document)
    }

    pub fn run_post_rebuild(&self, mut document: Vec<Node>) -> Result<Vec<Node>, SyncError> {
        for stage in &self.post_rebuild {
            document = stage.process(document)?;
        }
        Ok(document)
    }

    pub fn run_post_explode(&self, src_dir: &Path) -> Result<bool, SyncError> {
        let mut any_changed = false;
        for stage in &self.post_explode {
            any_changed |= stage.process(src_dir)?;
        }
        Ok(any_changed)
    }

    pub fn run_pre_rebuild(&self, src_dir: &Path) -> Result<bool, SyncError> {
        let mut any_changed = false;
        for stage in &self.pre_rebuild {
            any_changed |= stage.process(src_dir)?;
        }
        Ok(any_changed)
    }

    pub fn has_pre_explode_stages(&self) -> bool {
        !self.pre_explode.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct TagStage {
        name: &'static str,
        priority: u32,
    }

    impl DocumentStage for TagStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn process(&self, mut document: Vec<Node>) -> Result<Vec<Node>, SyncError> {
            let mut marker = Node::new();
            marker.insert("id".to_string(), Value::from(self.name));
            marker.insert("type".to_string(), Value::from("comment"));
            document.push(marker);
            Ok(document)
        }
    }

    #[test]
    fn document_stages_run_in_priority_order() {
        let mut registry = Registry::builtin(&ExtractorSettings::default());
        registry.register_pre_explode(Arc::new(TagStage {
            name: "second",
            priority: 20,
        }));
        registry.register_pre_explode(Arc::new(TagStage {
            name: "first",
            priority: 10,
        }));

        let document = registry.run_pre_explode(Vec::new()).unwrap();
        let ids: Vec<&str> = document
            .iter()
            .filter_map(|n| n.get("id").and_then(Value::as_str))
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn builtin_order_follows_priority() {
        let registry = Registry::builtin(&ExtractorSettings::default());
        let names: Vec<&str> = registry.extractors().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["func", "template", "info"]);
    }

    #[test]
    fn disabled_extractors_are_not_activated() {
        let settings = ExtractorSettings {
            disabled: vec!["template".to_string()],
            order: Vec::new(),
        };
        let registry = Registry::builtin(&settings);
        let names: Vec<&str> = registry.extractors().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["func", "info"]);
    }

    #[test]
    fn explicit_order_overrides_priority() {
        let settings = ExtractorSettings {
            disabled: Vec::new(),
            order: vec!["info".to_string(), "func".to_string()],
        };
        let registry = Registry::builtin(&settings);
        let names: Vec<&str> = registry.extractors().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["info", "func", "template"]);
    }
}
