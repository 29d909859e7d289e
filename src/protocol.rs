//! Wire types shared with the tree server.
//!
//! The server exposes a `GET /dot` snapshot/resumption endpoint, a
//! `GET /changes` server-sent-event feed, and a set of `POST` control
//! endpoints. All of them speak the JSON shapes defined here.

use serde::{Deserialize, Serialize};

/// A location within the tree: which epoch, which block within that epoch,
/// and which commitment within that block.
///
/// Positions are totally ordered lexicographically by (epoch, block,
/// commitment); the derived `Ord` relies on the field order below.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub epoch: u64,
    pub block: u64,
    pub commitment: u64,
}

impl Position {
    pub const fn new(epoch: u64, block: u64, commitment: u64) -> Self {
        Self {
            epoch,
            block,
            commitment,
        }
    }
}

/// Response body of `GET /dot`: the current graph description plus the
/// cursor it corresponds to.
///
/// `position` is `null` when the frontier is undefined (empty or full tree).
#[derive(Debug, Clone, Deserialize)]
pub struct TreeSnapshot {
    pub graph: String,
    pub forgotten: u64,
    pub position: Option<Position>,
}

/// Payload of a `changed` event on the `GET /changes` feed.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChangeEvent {
    pub position: Option<Position>,
    pub forgotten: u64,
}

/// Error body returned by control endpoints on failure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerError {
    pub error: String,
}
