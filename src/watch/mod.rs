//! Sync engine: long-lived bidirectional synchronization between the local
//! tree and the flows server.
//!
//! `Running` spawns three concurrent tasks over one shared state:
//! - the poll task fetches server changes on an interval with bounded
//!   backoff retry,
//! - the watch task owns the filesystem subscription, debounces change
//!   bursts, and rebuilds/deploys when a burst settles,
//! - the command task executes interactive or dashboard commands.

mod commands;
mod state;
mod subscription;

pub use commands::{spawn_stdin_commands, Command, HELP_LINES};
pub use state::SharedWatchState;
pub use subscription::{TreeSubscription, WatchOutcome};

use crate::codec::{self, CodecOptions, RebuildRunOptions};
use crate::config::ExtractorSettings;
use crate::error::SyncError;
use crate::extract::Registry;
use crate::graph;
use crate::reconcile::{self, NewFileMode};
use crate::server::ServerClient;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch as watch_channel, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Setup,
    Running,
    ShuttingDown,
    Stopped,
}

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
    /// Max consecutive poll failures before deferring to the next interval.
    pub max_poll_retries: u32,
    /// Base delay for poll retry backoff (doubles per failure).
    pub retry_base_delay: Duration,
    /// Consecutive rebuild failures before automatic rebuilds are skipped.
    pub max_rebuild_failures: u32,
    pub delete_orphaned: bool,
    pub new_files: NewFileMode,
    pub codec: CodecOptions,
    pub extractors: ExtractorSettings,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(2),
            max_poll_retries: 4,
            retry_base_delay: Duration::from_secs(2),
            max_rebuild_failures: 5,
            delete_orphaned: false,
            new_files: NewFileMode::default(),
            codec: CodecOptions::default(),
            extractors: ExtractorSettings::default(),
        }
    }
}

struct EngineInner {
    client: Arc<ServerClient>,
    registry: Mutex<Arc<Registry>>,
    document_path: PathBuf,
    src_dir: PathBuf,
    options: EngineOptions,
    state: SharedWatchState,
    phase: Mutex<EnginePhase>,
    /// Published by the watch task: whether a subscription is live.
    /// Pausing waits on this going false before tool writes begin.
    subscribed: watch_channel::Sender<bool>,
    /// Serializes the download and rebuild pipelines.
    pipeline: AsyncMutex<()>,
    rebuild_failures: AtomicU32,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        client: Arc<ServerClient>,
        registry: Registry,
        document_path: PathBuf,
        src_dir: PathBuf,
        options: EngineOptions,
    ) -> Self {
        let (subscribed, _) = watch_channel::channel(false);
        SyncEngine {
            inner: Arc::new(EngineInner {
                client,
                registry: Mutex::new(Arc::new(registry)),
                document_path,
                src_dir,
                options,
                state: SharedWatchState::new(),
                phase: Mutex::new(EnginePhase::Idle),
                subscribed,
                pipeline: AsyncMutex::new(()),
                rebuild_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        *self.inner.phase.lock().expect("phase lock poisoned")
    }

    fn set_phase(&self, phase: EnginePhase) {
        debug!("Engine phase: {:?}", phase);
        *self.inner.phase.lock().expect("phase lock poisoned") = phase;
    }

    pub fn state(&self) -> SharedWatchState {
        self.inner.state.clone()
    }

    fn registry(&self) -> Arc<Registry> {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .clone()
    }

    /// Run the engine until quit/interrupt. `commands` is the merged
    /// interactive/dashboard command stream.
    pub async fn run(&self, mut commands: mpsc::Receiver<Command>) -> Result<(), SyncError> {
        self.set_phase(EnginePhase::Setup);

        if !self.inner.src_dir.exists() {
            info!(
                "Creating source directory: {}",
                self.inner.src_dir.display()
            );
            std::fs::create_dir_all(&self.inner.src_dir)?;
        }

        // Initial connectivity check; repeated auth failure here is fatal.
        self.inner.client.connect().await?;

        self.set_phase(EnginePhase::Running);
        let poll_handle = tokio::spawn(poll_task(self.clone()));
        let watch_handle = tokio::spawn(watch_task(self.clone()));
        info!("Type '?' or 'help' for available commands");

        loop {
            tokio::select! {
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(Command::Quit) => {
                            self.handle_command(Command::Quit).await;
                            break;
                        }
                        Some(command) => {
                            self.handle_command(command).await;
                            if self.inner.state.is_shutdown() {
                                break;
                            }
                        }
                        // Command source closed; stay alive for the tasks.
                        None => {
                            while !self.inner.state.is_shutdown() {
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received - initiating graceful shutdown...");
                    self.inner.state.request_shutdown();
                    break;
                }
            }
        }

        self.set_phase(EnginePhase::ShuttingDown);
        self.inner.state.request_shutdown();

        // Wait briefly for an in-flight pause/rebuild to finish, then join.
        let joined = tokio::time::timeout(Duration::from_secs(30), async {
            let _ = poll_handle.await;
            let _ = watch_handle.await;
        })
        .await;
        if joined.is_err() {
            warn!("Shutdown timed out waiting for background tasks");
        }

        self.set_phase(EnginePhase::Stopped);
        info!("Watch mode shutdown complete");
        Ok(())
    }

    pub async fn handle_command(&self, command: Command) {
        match command {
            Command::Download => {
                info!("Manual download triggered...");
                if let Err(e) = self.download_and_explode(true).await {
                    error!("Download failed: {e}");
                }
            }
            Command::Upload => {
                info!("Manual upload triggered (force rebuild)...");
                match self.rebuild_and_deploy(true).await {
                    Ok(()) => {
                        self.inner.rebuild_failures.store(0, Ordering::Relaxed);
                        // Re-fetch so ETag/revision track the deployed state.
                        info!("Verifying upload...");
                        if let Err(e) = self.download_and_explode(true).await {
                            warn!("Post-upload verification failed: {e}");
                        }
                    }
                    Err(e) => error!("Rebuild failed, cannot upload: {e}"),
                }
            }
            Command::Check => {
                info!("Manual check triggered...");
                if let Err(e) = self.check_and_upload().await {
                    error!("Check failed: {e}");
                }
            }
            Command::ReloadExtractors => {
                info!("Reloading extractors...");
                let next = {
                    let current = self.registry();
                    current.reload(&self.inner.options.extractors)
                };
                *self
                    .inner
                    .registry
                    .lock()
                    .expect("registry lock poisoned") = Arc::new(next);
            }
            Command::Status => self.log_status(),
            Command::Quit => {
                info!("Initiating graceful shutdown...");
                self.inner.state.request_shutdown();
            }
            Command::Help => {
                for line in HELP_LINES {
                    info!("{line}");
                }
            }
        }
    }

    fn log_status(&self) {
        let stats = self.inner.client.stats();
        info!("=== Watch Mode Status ===");
        info!("Server: {}", self.inner.client.server_url());
        info!("Phase: {:?}", self.phase());
        info!("Synchronization:");
        info!("  ETag: {}", stats.etag.as_deref().unwrap_or("(none)"));
        info!("  Rev: {}", stats.revision.as_deref().unwrap_or("(none)"));
        info!(
            "  Convergence: {}",
            if stats.convergence_paused {
                "paused (manual uploads only)"
            } else {
                "active"
            }
        );
        info!("Statistics:");
        info!("  Downloads: {}", stats.downloads);
        info!("  Uploads: {}", stats.uploads);
        info!("  Errors: {}", stats.errors);
        if let Some(ago) = stats.last_download_ago {
            info!("  Last download: {}s ago", ago.as_secs());
        }
        if let Some(ago) = stats.last_upload_ago {
            info!("  Last upload: {}s ago", ago.as_secs());
        }
    }

    /// Pause the watcher around tool-initiated writes: sets the pause flag,
    /// waits until the subscription is fully torn down, runs `work`, then
    /// resumes and clears stale pending state.
    async fn with_watcher_paused<T>(&self, work: impl std::future::Future<Output = T>) -> T {
        self.inner.state.set_paused(true);
        let mut subscribed = self.inner.subscribed.subscribe();
        while *subscribed.borrow_and_update() {
            if subscribed.changed().await.is_err() {
                break;
            }
        }

        let result = work.await;

        self.inner.state.set_paused(false);
        self.inner.state.clear_pending();
        result
    }

    /// Fetch from the server; when the document changed, write it and run
    /// the explode pipeline. Returns whether anything changed.
    pub async fn download_and_explode(&self, force: bool) -> Result<bool, SyncError> {
        let _guard = self.inner.pipeline.lock().await;

        let outcome = self.inner.client.fetch(force).await?;
        if !outcome.changed {
            return Ok(false);
        }
        let document = outcome.document.unwrap_or_default();
        if let Some(revision) = self.inner.client.last_revision() {
            info!("Current server rev: {revision}");
        }
        graph::write_document(&self.inner.document_path, &document)?;

        self.with_watcher_paused(self.explode_pipeline()).await?;
        info!("Download and explode complete");
        Ok(true)
    }

    /// Explode the just-downloaded document. When a pre-explode stage
    /// rewrites it, or any node is unstable, the canonical form is pushed
    /// back as an automated deploy.
    async fn explode_pipeline(&self) -> Result<(), SyncError> {
        let registry = self.registry();
        let mut document = graph::load_document(&self.inner.document_path)?;

        if registry.has_pre_explode_stages() {
            let original = graph::to_compact_json(&document);
            document = registry.run_pre_explode(document)?;
            if graph::to_compact_json(&document) != original {
                graph::write_document(&self.inner.document_path, &document)?;
                info!("Flows modified by pre-explode stages, uploading...");
                self.inner.client.deploy(&document, false).await?;
            }
        }

        let outcome =
            codec::explode_document(&document, &registry, &self.inner.src_dir, &self.inner.options.codec)
                .await?;

        let containers = graph::container_ids(&document);
        let orphaned = reconcile::find_orphaned(&self.inner.src_dir, &outcome.skeleton, &containers)?;
        if !orphaned.is_empty() {
            reconcile::handle_orphaned(&orphaned, &self.inner.src_dir, self.inner.options.delete_orphaned)?;
        }

        let post_changed = registry.run_post_explode(&self.inner.src_dir)?;

        if outcome.any_unstable || post_changed {
            info!("Changes detected, rebuilding and uploading...");
            let nodes = codec::run_rebuild(
                &self.inner.document_path,
                &self.inner.src_dir,
                &registry,
                &self.rebuild_options(),
            )
            .await?;
            self.inner.client.deploy(&nodes, false).await?;
            info!("Canonical form uploaded");
        }
        Ok(())
    }

    fn rebuild_options(&self) -> RebuildRunOptions {
        RebuildRunOptions {
            new_files: self.inner.options.new_files,
            codec: self.inner.options.codec.clone(),
        }
    }

    /// Rebuild the document from the tree and deploy it.
    pub async fn rebuild_and_deploy(&self, user_initiated: bool) -> Result<(), SyncError> {
        let _guard = self.inner.pipeline.lock().await;

        let registry = self.registry();
        let nodes = self
            .with_watcher_paused(codec::run_rebuild(
                &self.inner.document_path,
                &self.inner.src_dir,
                &registry,
                &self.rebuild_options(),
            ))
            .await?;

        self.inner.client.deploy(&nodes, user_initiated).await?;
        info!("Rebuild and deploy complete");
        Ok(())
    }

    /// Rebuild and upload only when the result differs from the current
    /// document.
    async fn check_and_upload(&self) -> Result<(), SyncError> {
        let _guard = self.inner.pipeline.lock().await;

        let original = std::fs::read_to_string(&self.inner.document_path).unwrap_or_default();
        let registry = self.registry();
        let nodes = self
            .with_watcher_paused(codec::run_rebuild(
                &self.inner.document_path,
                &self.inner.src_dir,
                &registry,
                &self.rebuild_options(),
            ))
            .await?;

        if graph::to_compact_json(&nodes) != original {
            info!("Changes detected, uploading...");
            self.inner.client.deploy(&nodes, true).await?;
        } else {
            info!("No changes detected");
        }
        Ok(())
    }
}

/// Periodic server polling with bounded exponential backoff on failure.
async fn poll_task(engine: SyncEngine) {
    let options = engine.inner.options.clone();
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::time::sleep(options.poll_interval).await;
        if engine.inner.state.is_shutdown() {
            info!("Polling task exiting gracefully...");
            break;
        }

        match engine.download_and_explode(false).await {
            Ok(_) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= options.max_poll_retries {
                    let delay = options.retry_base_delay * 2u32.pow(consecutive_failures - 1);
                    warn!(
                        "Download failed (attempt {consecutive_failures}/{}): {e}, retrying in {}s...",
                        options.max_poll_retries,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!(
                        "Download failed after {} retries, will retry on next poll interval",
                        options.max_poll_retries
                    );
                    consecutive_failures = 0;
                }
            }
        }
    }
}

/// Own the filesystem subscription: wait for settled change bursts, tear
/// the subscription down before rebuilding, recreate it afterwards.
async fn watch_task(engine: SyncEngine) {
    let options = engine.inner.options.clone();

    loop {
        if engine.inner.state.is_shutdown() {
            break;
        }
        if engine.inner.state.is_paused() {
            engine.inner.subscribed.send_replace(false);
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let mut subscription = match TreeSubscription::start(&engine.inner.src_dir) {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Cannot watch {}: {e}", engine.inner.src_dir.display());
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        engine.inner.subscribed.send_replace(true);
        // Resuming clears anything recorded while the watcher was down.
        engine.inner.state.clear_pending();

        let outcome = subscription
            .wait_for_settled_change(options.debounce, &engine.inner.state)
            .await;

        // Unsubscribe fully before any write the rebuild may perform.
        engine.inner.subscribed.send_replace(false);
        drop(subscription);

        match outcome {
            WatchOutcome::Settled => {
                let failures = engine.inner.rebuild_failures.load(Ordering::Relaxed);
                if failures >= options.max_rebuild_failures {
                    error!("Skipping rebuild after {failures} consecutive failures");
                    error!("Save a file again to retry, or use the 'upload' command");
                    engine.inner.rebuild_failures.store(0, Ordering::Relaxed);
                    continue;
                }
                match engine.rebuild_and_deploy(true).await {
                    Ok(()) => {
                        engine.inner.rebuild_failures.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let now = engine
                            .inner
                            .rebuild_failures
                            .fetch_add(1, Ordering::Relaxed)
                            + 1;
                        warn!(
                            "Rebuild/deploy failed (failure {now}/{}): {e}",
                            options.max_rebuild_failures
                        );
                    }
                }
            }
            WatchOutcome::Paused => {
                // Loop back around; the pause branch idles until resumed.
            }
            WatchOutcome::Shutdown | WatchOutcome::Closed => break,
        }
    }

    engine.inner.subscribed.send_replace(false);
    info!("File watcher exiting gracefully...");
}
