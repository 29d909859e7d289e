//! Live terminal client for a remote tiered commitment tree.
//!
//! The client keeps a local view of the server's append-only, periodically
//! pruned tree synchronized through resumable long polls and a push feed,
//! renders the tree's DOT description through an external layout engine,
//! and dispatches keystroke commands against the server's control surface
//! with bounded concurrency.

pub mod changes;
pub mod config;
pub mod dispatch;
pub mod position;
pub mod protocol;
pub mod render;
pub mod status;
pub mod sync;
pub mod telemetry;
