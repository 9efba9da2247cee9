//! sinkd: a bidirectional directory synchronization daemon.
//!
//! Two daemons hold the same tree converged: a filesystem watcher queues
//! local changes, peers exchange manifests and negotiate per-path actions
//! against a persisted baseline, and a transfer engine moves content with
//! resume and verification. Conflicts never lose data; by default both
//! versions are preserved under conflict names.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod meta;
pub mod path;
pub mod protocol;
pub mod queue;
pub mod resolve;
pub mod state;
pub mod transfer;
pub mod watch;

pub use config::{ContentPolicy, DeletePolicy, SyncConfig};
pub use daemon::SyncCore;
pub use error::{Result, SyncError};
pub use path::{Endpoint, PathKey};
