//! flowsync — keep a flows document, a per-node source tree, and a remote
//! server in sync.
//!
//! Two subsystems:
//! - the structural codec ([`codec`]) that explodes a flows document into a
//!   skeleton plus per-node files and rebuilds it byte-compatibly, and
//! - the sync engine ([`watch`]) that watches the tree, polls the server,
//!   resolves deploy conflicts, and damps upload/download feedback loops.

pub mod codec;
pub mod config;
pub mod error;
pub mod extract;
pub mod graph;
pub mod reconcile;
pub mod server;
pub mod skeleton;
pub mod watch;

pub use error::SyncError;

/// Default server URL when none is configured.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:1880";
