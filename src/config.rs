//! Runtime configuration for the live view client.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use url::Url;

/// How the dispatcher decides whether to keep issuing command requests
/// while earlier ones are still outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AdmissionStrategy {
    /// Hard ceiling: never more than `concurrency_limit` outstanding.
    #[default]
    Strict,
    /// Admit while `in_flight < random() * 2 * concurrency_limit`. Smooths
    /// perceived latency at the cost of probabilistic bursts near the limit.
    Random,
}

/// Tunables for every subsystem, assembled once at startup and shared by
/// value. Defaults match the behavior the server was tuned against.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the tree server, e.g. `http://127.0.0.1:8080`.
    pub server: Url,
    /// Delay before retrying a failed poll or a dropped change feed.
    pub retry_delay: Duration,
    /// Delay between back-to-back resumption polls.
    pub resume_delay: Duration,
    /// Minimum spacing between render starts.
    pub render_cooldown: Duration,
    /// Target wall-clock cost for one layout pass; the precision controller
    /// steers toward this.
    pub render_target: Duration,
    /// Multiplicative step for precision adjustments.
    pub precision_factor: f64,
    /// Ceiling on simultaneously outstanding command requests.
    pub concurrency_limit: usize,
    pub admission: AdmissionStrategy,
    /// Layout program to shell out to.
    pub layout_program: String,
    /// Where to write the rendered artifact, if anywhere.
    pub graph_output: Option<PathBuf>,
}

impl Config {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            retry_delay: Duration::from_millis(1000),
            resume_delay: Duration::ZERO,
            render_cooldown: Duration::from_millis(450),
            render_target: Duration::from_millis(1000),
            precision_factor: 1.5,
            concurrency_limit: 500,
            admission: AdmissionStrategy::default(),
            layout_program: "dot".to_string(),
            graph_output: None,
        }
    }

    /// Join a path onto the server base, preserving any base path prefix.
    pub fn endpoint(&self, path: &str) -> Url {
        let mut url = self.server.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .expect("server URL validated as a base at startup");
            segments.pop_if_empty().push(path);
        }
        url
    }
}
