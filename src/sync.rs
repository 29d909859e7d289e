//! Keeps the local view of the tree synchronized with the server.
//!
//! One task owns the [`PositionTracker`] and the latest graph description.
//! It alternates between two poll modes against `GET /dot`:
//!
//! - a catch-up poll (no query) fetching a fresh snapshot, used on startup
//!   and whenever the change bridge reports an interior mutation;
//! - a resumption poll carrying the current cursor plus `next=true`, which
//!   the server parks until state advances past that cursor.
//!
//! Exactly one resumption poll is in flight at a time; catch-up polls are
//! issued alongside it from the same task, so cursor and graph keep a
//! single writer. Transport failures retry the same mode after a fixed
//! delay, forever. A cursor that moves backwards means the remote tree was
//! rebuilt: all local state is discarded and the session starts over.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::position::PositionTracker;
use crate::protocol::{Position, TreeSnapshot};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Status(StatusCode),
}

/// Out-of-band requests from the change bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// An interior mutation happened; fetch a fresh snapshot now.
    CatchUp,
    /// Backward motion observed on the change feed; rebuild from scratch.
    Reset,
}

/// Read-only copy of the cursor, published for the bridge and status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorView {
    pub position: Option<Position>,
    pub forgotten: u64,
}

/// Shared HTTP client tuned like the rest of the crate's requests: fail
/// fast on connect, never time out an established request (the resumption
/// poll blocks server-side on purpose), and skip proxies for localhost use.
pub fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .no_proxy()
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub struct SyncClient {
    http: Client,
    config: Config,
    tracker: PositionTracker,
    graph_tx: watch::Sender<String>,
    cursor_tx: watch::Sender<CursorView>,
}

impl SyncClient {
    pub fn new(
        http: Client,
        config: Config,
        graph_tx: watch::Sender<String>,
        cursor_tx: watch::Sender<CursorView>,
    ) -> Self {
        Self {
            http,
            config,
            tracker: PositionTracker::new(),
            graph_tx,
            cursor_tx,
        }
    }

    fn catchup_url(&self) -> Url {
        self.config.endpoint("dot")
    }

    /// Resumption query for the current cursor. With an undefined position
    /// only `forgotten` and `next` are sent; the server treats the missing
    /// components as "from the start".
    fn resume_url(&self) -> Url {
        let mut url = self.config.endpoint("dot");
        {
            let mut query = url.query_pairs_mut();
            if let Some(position) = self.tracker.position() {
                query
                    .append_pair("epoch", &position.epoch.to_string())
                    .append_pair("block", &position.block.to_string())
                    .append_pair("commitment", &position.commitment.to_string());
            }
            query
                .append_pair("forgotten", &self.tracker.forgotten().to_string())
                .append_pair("next", "true");
        }
        url
    }

    async fn fetch(http: Client, url: Url) -> Result<TreeSnapshot, SyncError> {
        let response = http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status(status));
        }
        Ok(response.json().await?)
    }

    async fn fetch_after(
        http: Client,
        url: Url,
        delay: Duration,
    ) -> Result<TreeSnapshot, SyncError> {
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
        Self::fetch(http, url).await
    }

    /// Retry one poll mode until it succeeds. Poll errors are background
    /// noise by design; they only ever show up in debug logs.
    async fn poll_until_success(&self, url: Url) -> TreeSnapshot {
        loop {
            match Self::fetch(self.http.clone(), url.clone()).await {
                Ok(snapshot) => return snapshot,
                Err(err) => {
                    debug!(%err, %url, "poll failed; retrying");
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Apply a snapshot. Returns false when the cursor moved backwards,
    /// in which case nothing was stored and the session must restart.
    fn apply(&mut self, snapshot: TreeSnapshot) -> bool {
        let applied = self
            .tracker
            .apply_update(snapshot.position, snapshot.forgotten);
        if applied.reset {
            return false;
        }
        self.cursor_tx.send_replace(CursorView {
            position: self.tracker.position(),
            forgotten: self.tracker.forgotten(),
        });
        self.graph_tx.send_replace(snapshot.graph);
        true
    }

    pub async fn run(mut self, mut signals: mpsc::Receiver<SyncSignal>) {
        'session: loop {
            self.tracker.reset();
            self.cursor_tx.send_replace(CursorView::default());

            let snapshot = self.poll_until_success(self.catchup_url()).await;
            // A fresh tracker accepts any cursor, so this cannot reset.
            self.apply(snapshot);
            info!(
                position = ?self.tracker.position(),
                forgotten = self.tracker.forgotten(),
                "synchronized"
            );

            let mut resume = Box::pin(Self::fetch_after(
                self.http.clone(),
                self.resume_url(),
                Duration::ZERO,
            ));
            loop {
                tokio::select! {
                    result = &mut resume => {
                        let delay = match result {
                            Ok(snapshot) => {
                                if !self.apply(snapshot) {
                                    debug!("cursor moved backwards; resynchronizing from scratch");
                                    continue 'session;
                                }
                                self.config.resume_delay
                            }
                            Err(err) => {
                                debug!(%err, "resumption poll failed; retrying");
                                self.config.retry_delay
                            }
                        };
                        resume = Box::pin(Self::fetch_after(
                            self.http.clone(),
                            self.resume_url(),
                            delay,
                        ));
                    }
                    signal = signals.recv() => match signal {
                        Some(SyncSignal::CatchUp) => {
                            // Interior mutations leave the cursor in place, so
                            // the parked resumption poll stays valid while this
                            // snapshot is fetched alongside it.
                            let snapshot = self.poll_until_success(self.catchup_url()).await;
                            if !self.apply(snapshot) {
                                continue 'session;
                            }
                        }
                        Some(SyncSignal::Reset) => {
                            debug!("change feed reported backward motion; resynchronizing");
                            continue 'session;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_at(base: &str) -> SyncClient {
        let config = Config::new(Url::parse(base).unwrap());
        let (graph_tx, _) = watch::channel(String::new());
        let (cursor_tx, _) = watch::channel(CursorView::default());
        SyncClient::new(http_client(), config, graph_tx, cursor_tx)
    }

    #[test]
    fn resume_url_omits_undefined_position() {
        let client = client_at("http://127.0.0.1:8080");
        assert_eq!(
            client.resume_url().as_str(),
            "http://127.0.0.1:8080/dot?forgotten=0&next=true"
        );
    }

    #[test]
    fn resume_url_carries_full_cursor() {
        let mut client = client_at("http://127.0.0.1:8080");
        assert!(client.apply(TreeSnapshot {
            graph: "digraph {}".into(),
            forgotten: 5,
            position: Some(Position::new(1, 2, 3)),
        }));
        assert_eq!(
            client.resume_url().as_str(),
            "http://127.0.0.1:8080/dot?epoch=1&block=2&commitment=3&forgotten=5&next=true"
        );
    }

    #[test]
    fn apply_publishes_graph_and_cursor() {
        let config = Config::new(Url::parse("http://127.0.0.1:8080").unwrap());
        let (graph_tx, graph_rx) = watch::channel(String::new());
        let (cursor_tx, cursor_rx) = watch::channel(CursorView::default());
        let mut client = SyncClient::new(http_client(), config, graph_tx, cursor_tx);

        assert!(client.apply(TreeSnapshot {
            graph: "digraph { a }".into(),
            forgotten: 2,
            position: Some(Position::new(0, 0, 1)),
        }));
        assert_eq!(*graph_rx.borrow(), "digraph { a }");
        assert_eq!(
            *cursor_rx.borrow(),
            CursorView {
                position: Some(Position::new(0, 0, 1)),
                forgotten: 2,
            }
        );
    }

    #[test]
    fn apply_rejects_backward_snapshot_without_publishing() {
        let config = Config::new(Url::parse("http://127.0.0.1:8080").unwrap());
        let (graph_tx, graph_rx) = watch::channel(String::new());
        let (cursor_tx, _) = watch::channel(CursorView::default());
        let mut client = SyncClient::new(http_client(), config, graph_tx, cursor_tx);

        assert!(client.apply(TreeSnapshot {
            graph: "digraph { new }".into(),
            forgotten: 0,
            position: Some(Position::new(2, 0, 0)),
        }));
        assert!(!client.apply(TreeSnapshot {
            graph: "digraph { stale }".into(),
            forgotten: 0,
            position: Some(Position::new(1, 9, 9)),
        }));
        assert_eq!(*graph_rx.borrow(), "digraph { new }");
    }
}
