//! Feeds accepted graph descriptions to the layout engine.
//!
//! Renders are serialized and rate-limited by a dirty/cooldown pair: a new
//! graph marks the view dirty, a render may only start when no cooldown is
//! active, and starting one arms the cooldown timer. Updates arriving
//! mid-cooldown coalesce; only the latest graph is ever rendered.
//!
//! Layout cost is kept near a target by a multiplicative feedback
//! controller on the precision parameter: renders slower than the target
//! coarsen the layout (faster next time), renders well under it refine it.
//! The parameter is clamped to [1, 100] after every step, so render cost
//! trends toward the target regardless of tree size.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Instant as TokioInstant, sleep_until};
use tracing::{debug, warn};

pub const MIN_PRECISION: u32 = 1;
pub const MAX_PRECISION: u32 = 100;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to spawn layout program '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("io error talking to layout program: {0}")]
    Io(#[from] std::io::Error),
    #[error("layout program exited with {status}: {stderr}")]
    Engine {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A finished layout pass: the artifact and how long the engine took.
#[derive(Debug, Clone)]
pub struct Layout {
    pub artifact: Vec<u8>,
    pub elapsed: Duration,
}

/// The external layout collaborator. Implementations are expected to be
/// slower at low precision values and faster at high ones.
#[async_trait]
pub trait LayoutEngine: Send + 'static {
    async fn layout(&self, dot: &str, precision: u32) -> Result<Layout, RenderError>;
}

/// Shells out to Graphviz. Precision caps the solver's iteration budget:
/// precision 1 allows the full budget (best fidelity), precision 100
/// almost none (fastest).
pub struct GraphvizEngine {
    program: String,
    output: Option<PathBuf>,
}

impl GraphvizEngine {
    pub fn new(program: String, output: Option<PathBuf>) -> Self {
        Self { program, output }
    }
}

#[async_trait]
impl LayoutEngine for GraphvizEngine {
    async fn layout(&self, dot: &str, precision: u32) -> Result<Layout, RenderError> {
        let iterations = (MAX_PRECISION / precision.clamp(MIN_PRECISION, MAX_PRECISION)).max(1);
        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .arg("-Tsvg")
            .arg(format!("-Gnslimit={iterations}"))
            .arg(format!("-Gnslimit1={iterations}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dot.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        let elapsed = start.elapsed();
        if !output.status.success() {
            return Err(RenderError::Engine {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        if let Some(path) = &self.output {
            std::fs::write(path, &output.stdout)?;
        }
        Ok(Layout {
            artifact: output.stdout,
            elapsed,
        })
    }
}

/// Multiplicative feedback controller for the precision parameter.
#[derive(Debug, Clone)]
pub struct PrecisionController {
    value: u32,
    factor: f64,
    target: Duration,
}

impl PrecisionController {
    pub fn new(target: Duration, factor: f64) -> Self {
        Self {
            value: MIN_PRECISION,
            factor,
            target,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Steer toward the target: too slow coarsens, comfortably fast
    /// refines, anything in the dead band between leaves the value alone.
    pub fn observe(&mut self, elapsed: Duration) {
        let elapsed = elapsed.as_secs_f64();
        let target = self.target.as_secs_f64();
        let next = if elapsed > target {
            self.value as f64 * self.factor
        } else if elapsed < target / self.factor {
            self.value as f64 / self.factor
        } else {
            return;
        };
        self.value = (next.round() as u32).clamp(MIN_PRECISION, MAX_PRECISION);
    }
}

pub struct Renderer<E: LayoutEngine> {
    engine: E,
    controller: PrecisionController,
    cooldown: Duration,
    graph_rx: watch::Receiver<String>,
}

impl<E: LayoutEngine> Renderer<E> {
    pub fn new(
        engine: E,
        controller: PrecisionController,
        cooldown: Duration,
        graph_rx: watch::Receiver<String>,
    ) -> Self {
        Self {
            engine,
            controller,
            cooldown,
            graph_rx,
        }
    }

    pub async fn run(mut self) {
        let mut dirty = false;
        let mut cooldown_active = false;
        let cooldown = sleep_until(TokioInstant::now());
        tokio::pin!(cooldown);
        loop {
            tokio::select! {
                changed = self.graph_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    dirty = true;
                }
                _ = cooldown.as_mut(), if cooldown_active => {
                    cooldown_active = false;
                }
            }
            if !dirty || cooldown_active {
                continue;
            }
            dirty = false;
            cooldown_active = true;
            // The cooldown runs from render start, not completion.
            cooldown.as_mut().reset(TokioInstant::now() + self.cooldown);
            let dot = self.graph_rx.borrow_and_update().clone();
            if dot.is_empty() {
                continue;
            }
            let precision = self.controller.value();
            match self.engine.layout(&dot, precision).await {
                Ok(layout) => {
                    self.controller.observe(layout.elapsed);
                    debug!(
                        elapsed = ?layout.elapsed,
                        precision,
                        next_precision = self.controller.value(),
                        artifact_bytes = layout.artifact.len(),
                        "rendered"
                    );
                }
                Err(err) => warn!(%err, "layout failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn controller_coarsens_when_slow() {
        let mut controller = PrecisionController::new(Duration::from_secs(1), 1.5);
        controller.observe(Duration::from_secs(2));
        assert_eq!(controller.value(), 2);
        controller.observe(Duration::from_secs(2));
        assert_eq!(controller.value(), 3);
    }

    #[test]
    fn controller_refines_when_fast() {
        let mut controller = PrecisionController::new(Duration::from_secs(1), 1.5);
        controller.observe(Duration::from_secs(10));
        controller.observe(Duration::from_secs(10));
        let coarse = controller.value();
        controller.observe(Duration::from_millis(100));
        assert!(controller.value() < coarse);
    }

    #[test]
    fn controller_holds_inside_dead_band() {
        let mut controller = PrecisionController::new(Duration::from_secs(1), 1.5);
        controller.observe(Duration::from_secs(2));
        let held = controller.value();
        // Between target/factor and target: no adjustment.
        controller.observe(Duration::from_millis(800));
        assert_eq!(controller.value(), held);
    }

    #[test]
    fn controller_never_leaves_bounds() {
        let mut controller = PrecisionController::new(Duration::from_secs(1), 1.5);
        for _ in 0..100 {
            controller.observe(Duration::from_secs(60));
        }
        assert_eq!(controller.value(), MAX_PRECISION);
        for _ in 0..100 {
            controller.observe(Duration::ZERO);
        }
        assert_eq!(controller.value(), MIN_PRECISION);
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        calls: Arc<Mutex<Vec<(String, u32)>>>,
        reported: Duration,
    }

    #[async_trait]
    impl LayoutEngine for FakeEngine {
        async fn layout(&self, dot: &str, precision: u32) -> Result<Layout, RenderError> {
            self.calls.lock().unwrap().push((dot.to_string(), precision));
            Ok(Layout {
                artifact: Vec::new(),
                elapsed: self.reported,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renders_coalesce_during_cooldown() {
        let (graph_tx, graph_rx) = watch::channel(String::new());
        let engine = FakeEngine::default();
        let calls = engine.calls.clone();
        let renderer = Renderer::new(
            engine,
            PrecisionController::new(Duration::from_secs(1), 1.5),
            Duration::from_millis(450),
            graph_rx,
        );
        let handle = tokio::spawn(renderer.run());

        // Two updates before the renderer gets scheduled: one render, of
        // the latest graph.
        graph_tx.send_replace("digraph { a }".into());
        graph_tx.send_replace("digraph { b }".into());
        tokio::time::sleep(Duration::from_millis(1)).await;
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, "digraph { b }");
        }

        // An update during cooldown waits for it to expire.
        graph_tx.send_replace("digraph { c }".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[1].0, "digraph { c }");
        }

        drop(graph_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_graph_is_not_rendered() {
        let (graph_tx, graph_rx) = watch::channel(String::new());
        let engine = FakeEngine::default();
        let calls = engine.calls.clone();
        let renderer = Renderer::new(
            engine,
            PrecisionController::new(Duration::from_secs(1), 1.5),
            Duration::from_millis(450),
            graph_rx,
        );
        let handle = tokio::spawn(renderer.run());

        graph_tx.send_replace(String::new());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(calls.lock().unwrap().is_empty());

        drop(graph_tx);
        handle.await.unwrap();
    }
}
