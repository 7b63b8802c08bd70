//! Shared runtime state for the watch tasks.
//!
//! One mutex guards all four fields so the poll, watch, and command tasks
//! never observe a partial update. The lock is held for assignments only,
//! never across I/O.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct WatchState {
    pub rebuild_pending: bool,
    pub pause_watching: bool,
    pub shutdown_requested: bool,
    pub last_file_change: Option<Instant>,
}

/// Handle to the mutex-guarded watch state shared by all engine tasks.
#[derive(Clone, Default)]
pub struct SharedWatchState(Arc<Mutex<WatchState>>);

impl SharedWatchState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.0.lock().expect("watch state lock poisoned")
    }

    /// Record a relevant file change. Ignored while watching is paused
    /// (those changes are tool-generated, not user edits).
    pub fn record_change(&self) -> bool {
        let mut state = self.lock();
        if state.pause_watching {
            return false;
        }
        state.last_file_change = Some(Instant::now());
        state.rebuild_pending = true;
        true
    }

    /// Clear any pending rebuild, e.g. when resuming after a pause.
    pub fn clear_pending(&self) {
        let mut state = self.lock();
        state.rebuild_pending = false;
        state.last_file_change = None;
    }

    /// Consume a due rebuild: true when a rebuild is pending and the
    /// debounce interval has elapsed since the last change.
    pub fn take_due_rebuild(&self, debounce: Duration) -> bool {
        let mut state = self.lock();
        if !state.rebuild_pending {
            return false;
        }
        let due = state
            .last_file_change
            .is_some_and(|last| last.elapsed() >= debounce);
        if due {
            state.rebuild_pending = false;
        }
        due
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().pause_watching = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause_watching
    }

    pub fn request_shutdown(&self) {
        self.lock().shutdown_requested = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_state_discards_changes() {
        let state = SharedWatchState::new();
        state.set_paused(true);
        assert!(!state.record_change());
        assert!(!state.take_due_rebuild(Duration::ZERO));

        state.set_paused(false);
        assert!(state.record_change());
        assert!(state.take_due_rebuild(Duration::ZERO));
        // Consumed: a second take yields nothing.
        assert!(!state.take_due_rebuild(Duration::ZERO));
    }

    #[test]
    fn rebuild_not_due_before_debounce() {
        let state = SharedWatchState::new();
        state.record_change();
        assert!(!state.take_due_rebuild(Duration::from_secs(60)));
        // Still pending, just not due yet.
        assert!(state.take_due_rebuild(Duration::ZERO));
    }
}
