//! Filesystem subscription lifecycle.
//!
//! The subscription is an explicit start/stop object: pausing the watcher
//! and rebuilding both drop it entirely (unsubscribing at the OS level)
//! rather than merely gating events behind a flag, which eliminates races
//! with self-generated writes. Dropping the subscription stops the
//! underlying watcher.

use super::state::SharedWatchState;
use crate::error::SyncError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often the settle loop re-checks shared flags.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Why a settle wait ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A change burst occurred and the debounce interval elapsed.
    Settled,
    /// A pause was requested; the caller must drop the subscription.
    Paused,
    /// Shutdown was requested.
    Shutdown,
    /// The watcher channel closed unexpectedly.
    Closed,
}

pub struct TreeSubscription {
    // Kept alive for the subscription's lifetime; dropping unsubscribes.
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<Result<Event, notify::Error>>,
    root: PathBuf,
    // Some platforms report canonicalized event paths (e.g. /private/tmp
    // on macOS); keep both spellings for prefix stripping.
    canonical_root: PathBuf,
}

impl TreeSubscription {
    /// Subscribe recursively to filesystem changes under `root`.
    pub fn start(root: &Path) -> Result<Self, SyncError> {
        let (tx, rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                // notify delivers from its own thread; blocking_send is safe.
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        info!("Watching {} for changes", root.display());
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Ok(TreeSubscription {
            _watcher: watcher,
            events: rx,
            root: root.to_path_buf(),
            canonical_root,
        })
    }

    /// Whether an event is a user-relevant change: create/modify of a
    /// non-hidden file (hidden components cover the skeleton file and the
    /// orphan subtree).
    fn is_relevant(&self, event: &Event) -> bool {
        if !(event.kind.is_create() || event.kind.is_modify()) {
            return false;
        }
        event
            .paths
            .iter()
            .any(|path| self.is_relevant_path(path))
    }

    fn is_relevant_path(&self, path: &Path) -> bool {
        if path.is_dir() {
            return false;
        }
        let relative = path
            .strip_prefix(&self.root)
            .or_else(|_| path.strip_prefix(&self.canonical_root))
            .ok();
        match relative {
            Some(relative) => !relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.')),
            // Outside the tree as far as we can tell; judge the name only.
            None => !path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true),
        }
    }

    /// Wait until a change burst settles (debounce elapsed with no further
    /// changes), a pause or shutdown is requested, or the channel closes.
    ///
    /// Relevant events are recorded into the shared state; the settled
    /// decision reads the same state, so manual state manipulation (e.g.
    /// clearing stale pending on resume) composes correctly.
    pub async fn wait_for_settled_change(
        &mut self,
        debounce: Duration,
        state: &SharedWatchState,
    ) -> WatchOutcome {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        None => return WatchOutcome::Closed,
                        Some(Err(e)) => warn!("File watcher error: {e}"),
                        Some(Ok(event)) => {
                            if self.is_relevant(&event) && state.record_change() {
                                debug!("File changed: {:?}", event.paths);
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    if state.is_shutdown() {
                        return WatchOutcome::Shutdown;
                    }
                    if state.is_paused() {
                        return WatchOutcome::Paused;
                    }
                    if state.take_due_rebuild(debounce) {
                        return WatchOutcome::Settled;
                    }
                }
            }
        }
    }
}
