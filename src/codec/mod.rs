//! Structural codec: explode a flows document into skeleton + per-node
//! files, and rebuild the document byte-compatibly.

mod explode;
mod rebuild;

pub use explode::{explode_document, ExplodeOutcome};
pub use rebuild::{rebuild_document, rebuild_single_node};

use crate::error::SyncError;
use crate::extract::Registry;
use crate::graph;
use crate::reconcile::{self, NewFileMode};
use crate::skeleton;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Minimum node count before batch work fans out to the worker pool.
pub const PARALLEL_THRESHOLD: usize = 20;

/// Knobs for codec batch processing.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Worker cap; `None` means available parallelism.
    pub max_workers: Option<usize>,
    /// When false, batches always run sequentially.
    pub parallel: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            max_workers: None,
            parallel: true,
        }
    }
}

impl CodecOptions {
    fn worker_count(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Run per-node jobs, either sequentially or on a semaphore-bounded pool.
///
/// Results land in a pre-sized slot vector indexed by original position so
/// output order is deterministic regardless of completion order. A shared
/// lock-guarded counter drives progress reporting.
pub(crate) async fn run_batch<T, F>(jobs: Vec<F>, options: &CodecOptions, label: &str) -> Vec<Option<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let total = jobs.len();
    if !options.parallel || total < PARALLEL_THRESHOLD {
        return jobs.into_iter().map(|job| Some(job())).collect();
    }

    let workers = options.worker_count().max(1);
    debug!("{label}: processing {total} nodes with {workers} workers");

    let semaphore = Arc::new(Semaphore::new(workers));
    let progress = Arc::new(Mutex::new(0usize));
    let mut in_flight = FuturesUnordered::new();

    for (idx, job) in jobs.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let progress = progress.clone();
        let label = label.to_string();
        in_flight.push(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = tokio::task::spawn_blocking(job).await;
            let done = {
                let mut counter = progress.lock().expect("progress lock poisoned");
                *counter += 1;
                *counter
            };
            debug!("{label}: {done}/{total}");
            (idx, result)
        });
    }

    let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);
    while let Some((idx, result)) = in_flight.next().await {
        match result {
            Ok(value) => slots[idx] = Some(value),
            Err(e) => warn!("{label}: worker failed: {e}"),
        }
    }
    slots
}

/// Outcome of a full explode pass.
pub struct ExplodeReport {
    pub node_count: usize,
    /// True when any node was unstable or a post-explode stage modified
    /// files; the caller should rebuild and deploy the canonical form.
    pub needs_rebuild: bool,
}

/// Options for [`run_explode`].
#[derive(Debug, Clone, Default)]
pub struct ExplodeRunOptions {
    /// Delete orphaned files instead of moving them aside.
    pub delete_orphaned: bool,
    pub codec: CodecOptions,
}

/// Full explode pipeline: load, pre-explode stages, explode, reconcile
/// orphans, post-explode stages.
pub async fn run_explode(
    document_path: &Path,
    src_dir: &Path,
    registry: &Arc<Registry>,
    options: &ExplodeRunOptions,
) -> Result<ExplodeReport, SyncError> {
    info!(
        "Exploding {} to {}/",
        document_path.display(),
        src_dir.display()
    );

    let document = graph::load_document(document_path)?;
    if document.is_empty() {
        warn!("Flows document is empty");
    }

    let document = registry.run_pre_explode(document)?;
    let outcome = explode_document(&document, registry, src_dir, &options.codec).await?;

    let containers = graph::container_ids(&document);
    let orphaned = reconcile::find_orphaned(src_dir, &outcome.skeleton, &containers)?;
    if !orphaned.is_empty() {
        reconcile::handle_orphaned(&orphaned, src_dir, options.delete_orphaned)?;
    }

    let post_changed = registry.run_post_explode(src_dir)?;

    info!("Exploded {} nodes to {}/", document.len(), src_dir.display());
    Ok(ExplodeReport {
        node_count: document.len(),
        needs_rebuild: outcome.any_unstable || post_changed,
    })
}

/// Options for [`run_rebuild`].
#[derive(Debug, Clone, Default)]
pub struct RebuildRunOptions {
    pub new_files: NewFileMode,
    pub codec: CodecOptions,
}

/// Full rebuild pipeline: load skeleton, fold in new files, pre-rebuild
/// stages, rebuild, post-rebuild stages, write the document.
pub async fn run_rebuild(
    document_path: &Path,
    src_dir: &Path,
    registry: &Arc<Registry>,
    options: &RebuildRunOptions,
) -> Result<Vec<graph::Node>, SyncError> {
    info!(
        "Rebuilding {} from {}/",
        document_path.display(),
        src_dir.display()
    );

    let mut entries = skeleton::load_skeleton(src_dir, Some(document_path))?;
    let containers = graph::container_ids(&entries);

    let new_files = reconcile::find_new_files(src_dir, &entries, registry)?;
    if !new_files.is_empty() {
        let new_nodes =
            reconcile::handle_new_files(&new_files, src_dir, registry, options.new_files, &containers)?;
        entries.extend(new_nodes);
    }

    registry.run_pre_rebuild(src_dir)?;

    let nodes = rebuild_document(&entries, registry, src_dir, &options.codec).await?;
    let nodes = registry.run_post_rebuild(nodes)?;

    graph::write_document(document_path, &nodes)?;
    info!("Rebuilt {} nodes to {}", nodes.len(), document_path.display());
    Ok(nodes)
}
