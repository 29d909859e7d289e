//! Turns keystrokes into bounded-concurrency command requests.
//!
//! Recognized keys map onto the server's control endpoints. Repeats are
//! run-length encoded: digits accumulate a count prefix, and pressing the
//! same command key as the current top of the pending stack merges counts
//! instead of pushing, so the stack is bounded by the number of distinct
//! consecutive commands rather than total keystrokes.
//!
//! The drain loop advances only the top-of-stack entry, so issuance order
//! per key is preserved; completions across keys may still interleave at
//! the network layer. Admission is semaphore-gated rather than recursive:
//! at most `concurrency_limit` command requests are outstanding under the
//! strict policy (double that, probabilistically, under the random one).
//! A failed command hard-aborts the whole queue: pending work is cleared,
//! an error is surfaced, nothing is retried. In-flight requests are never
//! cancelled; cancellation only stops future dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use reqwest::{Client, Method};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, warn};
use url::Url;

use crate::config::{AdmissionStrategy, Config};
use crate::protocol::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKey {
    /// Insert a random commitment, witnessed (kept for proving).
    InsertKeep,
    /// Insert a random commitment, immediately forgettable.
    InsertForget,
    /// Forget a random witnessed commitment.
    Forget,
    EndBlock,
    InsertBlockRoot,
    EndEpoch,
    InsertEpochRoot,
    /// Reset the remote tree to empty.
    New,
    /// Query the current root hash.
    Root,
}

/// How a command is carried on the wire.
pub struct CommandSpec {
    pub method: Method,
    pub path: &'static str,
    pub query: &'static [(&'static str, &'static str)],
    /// Whether the endpoint accepts `repeat=N`, letting N queued repeats
    /// collapse into one request.
    pub supports_repeat: bool,
}

impl CommandKey {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'i' => CommandKey::InsertKeep,
            'I' => CommandKey::InsertForget,
            'f' => CommandKey::Forget,
            'b' => CommandKey::EndBlock,
            'B' => CommandKey::InsertBlockRoot,
            'e' => CommandKey::EndEpoch,
            'E' => CommandKey::InsertEpochRoot,
            'n' => CommandKey::New,
            'r' => CommandKey::Root,
            _ => return None,
        })
    }

    pub fn spec(self) -> CommandSpec {
        match self {
            CommandKey::InsertKeep => CommandSpec {
                method: Method::POST,
                path: "insert",
                query: &[("witness", "keep")],
                supports_repeat: true,
            },
            CommandKey::InsertForget => CommandSpec {
                method: Method::POST,
                path: "insert",
                query: &[("witness", "forget")],
                supports_repeat: true,
            },
            CommandKey::Forget => CommandSpec {
                method: Method::POST,
                path: "forget",
                query: &[],
                supports_repeat: true,
            },
            CommandKey::EndBlock => CommandSpec {
                method: Method::POST,
                path: "end-block",
                query: &[],
                supports_repeat: true,
            },
            CommandKey::InsertBlockRoot => CommandSpec {
                method: Method::POST,
                path: "insert-block-root",
                query: &[],
                supports_repeat: true,
            },
            CommandKey::EndEpoch => CommandSpec {
                method: Method::POST,
                path: "end-epoch",
                query: &[],
                supports_repeat: true,
            },
            CommandKey::InsertEpochRoot => CommandSpec {
                method: Method::POST,
                path: "insert-epoch-root",
                query: &[],
                supports_repeat: true,
            },
            CommandKey::New => CommandSpec {
                method: Method::POST,
                path: "new",
                query: &[],
                supports_repeat: false,
            },
            CommandKey::Root => CommandSpec {
                method: Method::GET,
                path: "root",
                query: &[],
                supports_repeat: false,
            },
        }
    }

    pub fn label(self) -> &'static str {
        self.spec().path
    }
}

/// A run-length-encoded repeat of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAction {
    pub key: CommandKey,
    pub remaining: u64,
}

/// The pending-action stack plus the numeric prefix accumulator.
///
/// Invariant: no two adjacent stack entries share a key.
#[derive(Debug, Default)]
pub struct ActionQueue {
    stack: Vec<PendingAction>,
    prefix: Option<u64>,
}

impl ActionQueue {
    pub fn push_digit(&mut self, digit: u8) {
        debug_assert!(digit < 10);
        let prefix = self.prefix.unwrap_or(0);
        self.prefix = Some(prefix.saturating_mul(10).saturating_add(u64::from(digit)));
    }

    pub fn push_key(&mut self, key: CommandKey) {
        let count = self.prefix.take().unwrap_or(1);
        if count == 0 {
            return;
        }
        match self.stack.last_mut() {
            Some(top) if top.key == key => {
                top.remaining = top.remaining.saturating_add(count);
            }
            _ => self.stack.push(PendingAction {
                key,
                remaining: count,
            }),
        }
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.prefix = None;
    }

    /// Take the next batch to issue from the top of the stack: the whole
    /// remaining count for repeat-capable endpoints, one unit otherwise.
    pub fn next_batch(&mut self) -> Option<(CommandKey, u64)> {
        loop {
            let top = self.stack.last_mut()?;
            if top.remaining == 0 {
                self.stack.pop();
                continue;
            }
            let key = top.key;
            let take = if key.spec().supports_repeat {
                std::mem::take(&mut top.remaining)
            } else {
                top.remaining -= 1;
                1
            };
            if top.remaining == 0 {
                self.stack.pop();
            }
            return Some((key, take));
        }
    }

    pub fn pending_units(&self) -> u64 {
        self.stack.iter().map(|action| action.remaining).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn entries(&self) -> &[PendingAction] {
        &self.stack
    }
}

/// Keyboard input after decoding, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Digit(u8),
    Command(CommandKey),
    /// Hard cancel: clear pending work, leave in-flight requests alone.
    Cancel,
    Quit,
}

/// Snapshot of dispatcher state for the status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatus {
    pub pending: u64,
    pub in_flight: usize,
    pub error: Option<String>,
    pub last_root: Option<String>,
}

impl DispatchStatus {
    pub fn idle(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

#[derive(Debug, Error)]
enum CommandError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Server(String),
}

#[derive(Debug)]
enum Outcome {
    Done {
        key: CommandKey,
        body: Option<String>,
    },
    Failed {
        key: CommandKey,
        error: String,
    },
}

pub struct Dispatcher {
    http: Client,
    config: Config,
    queue: ActionQueue,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    error: Option<String>,
    last_root: Option<String>,
    status_tx: watch::Sender<DispatchStatus>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
}

impl Dispatcher {
    pub fn new(http: Client, config: Config, status_tx: watch::Sender<DispatchStatus>) -> Self {
        // The random policy can admit up to 2x the limit by construction.
        // Clamp so an absurd --concurrency-limit cannot overflow or exceed
        // the semaphore's permit bound.
        let permits = match config.admission {
            AdmissionStrategy::Strict => config.concurrency_limit,
            AdmissionStrategy::Random => config.concurrency_limit.saturating_mul(2),
        }
        .min(Semaphore::MAX_PERMITS);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            http,
            config,
            queue: ActionQueue::default(),
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            error: None,
            last_root: None,
            status_tx,
            outcome_tx,
            outcome_rx,
        }
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<InputEvent>) {
        loop {
            tokio::select! {
                event = input.recv() => match event {
                    Some(InputEvent::Digit(digit)) => self.queue.push_digit(digit),
                    Some(InputEvent::Command(key)) => {
                        self.error = None;
                        self.queue.push_key(key);
                    }
                    Some(InputEvent::Cancel) => {
                        debug!("cancel: clearing pending actions");
                        self.queue.clear();
                    }
                    Some(InputEvent::Quit) | None => return,
                },
                Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome),
            }
            self.drain();
            self.publish();
        }
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done { key, body } => {
                if key == CommandKey::Root {
                    if let Some(root) = body {
                        self.last_root = Some(root.trim().trim_matches('"').to_string());
                    }
                }
            }
            Outcome::Failed { key, error } => {
                warn!(%error, command = key.label(), "command failed; aborting action queue");
                self.queue.clear();
                self.error = Some(error);
            }
        }
    }

    /// Issue batches from the top of the stack while admission allows.
    /// When no slot is free this simply returns; the next completion wakes
    /// the run loop and drains again.
    fn drain(&mut self) {
        while !self.queue.is_empty() {
            let Some(permit) = self.try_admit() else {
                return;
            };
            let Some((key, repeat)) = self.queue.next_batch() else {
                return;
            };
            self.spawn_request(key, repeat, permit);
        }
    }

    fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        if self.config.admission == AdmissionStrategy::Random {
            let bound =
                rand::thread_rng().r#gen::<f64>() * 2.0 * self.config.concurrency_limit as f64;
            if self.in_flight.load(Ordering::Relaxed) as f64 >= bound {
                return None;
            }
        }
        self.semaphore.clone().try_acquire_owned().ok()
    }

    fn spawn_request(&self, key: CommandKey, repeat: u64, permit: OwnedSemaphorePermit) {
        let spec = key.spec();
        let mut url = self.config.endpoint(spec.path);
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in spec.query {
                query.append_pair(name, value);
            }
            if spec.supports_repeat && repeat > 1 {
                query.append_pair("repeat", &repeat.to_string());
            }
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let http = self.http.clone();
        let method = spec.method.clone();
        let outcome_tx = self.outcome_tx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = execute(http, method, url).await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            let outcome = match result {
                Ok(body) => Outcome::Done { key, body },
                Err(err) => Outcome::Failed {
                    key,
                    error: err.to_string(),
                },
            };
            let _ = outcome_tx.send(outcome);
        });
    }

    fn publish(&self) {
        self.status_tx.send_replace(DispatchStatus {
            pending: self.queue.pending_units(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            error: self.error.clone(),
            last_root: self.last_root.clone(),
        });
    }
}

async fn execute(http: Client, method: Method, url: Url) -> Result<Option<String>, CommandError> {
    let response = http.request(method, url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(if body.is_empty() { None } else { Some(body) })
    } else {
        let message = serde_json::from_str::<ServerError>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| format!("server returned {status}"));
        Err(CommandError::Server(message))
    }
}
