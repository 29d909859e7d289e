use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use canopy::changes::ChangeBridge;
use canopy::config::{AdmissionStrategy, Config};
use canopy::dispatch::{CommandKey, DispatchStatus, Dispatcher, InputEvent};
use canopy::render::{GraphvizEngine, PrecisionController, Renderer};
use canopy::status::{self, StatusLine};
use canopy::sync::{self, CursorView, SyncClient};
use canopy::telemetry::{self, LogConfig, LogLevel};
use clap::{Args, Parser};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        let _ = disable_raw_mode();
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "canopy",
    about = "🌳 Watch and drive a remote tiered commitment tree",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "CANOPY_SERVER",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL of the tree server"
    )]
    server: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(
        long,
        env = "CANOPY_CONCURRENCY_LIMIT",
        default_value_t = 500,
        help = "Ceiling on simultaneously outstanding command requests"
    )]
    concurrency_limit: usize,

    #[arg(
        long,
        value_enum,
        default_value_t = AdmissionStrategy::Strict,
        help = "Concurrency admission policy"
    )]
    admission: AdmissionStrategy,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 1000,
        help = "Fixed delay before retrying failed polls"
    )]
    retry_delay_ms: u64,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 450,
        help = "Minimum spacing between render starts"
    )]
    render_cooldown_ms: u64,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 1000,
        help = "Target wall-clock cost of one layout pass"
    )]
    render_target_ms: u64,

    #[arg(long, default_value = "dot", help = "Graphviz program used for layout")]
    layout_program: String,

    #[arg(
        long,
        value_name = "PATH",
        help = "Write the rendered SVG here after every layout pass"
    )]
    graph_output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CANOPY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CANOPY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid server URL '{server}': {source}")]
    InvalidServer {
        server: String,
        source: url::ParseError,
    },
    #[error("server URL '{0}' cannot be a base")]
    NotABase(String),
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).map_err(|err| CliError::Logging(err.to_string()))?;

    let mut config = Config::new(parse_server(&cli.server)?);
    config.concurrency_limit = cli.concurrency_limit;
    config.admission = cli.admission;
    config.retry_delay = Duration::from_millis(cli.retry_delay_ms);
    config.render_cooldown = Duration::from_millis(cli.render_cooldown_ms);
    config.render_target = Duration::from_millis(cli.render_target_ms);
    config.layout_program = cli.layout_program;
    config.graph_output = cli.graph_output;
    debug!(server = %config.server, "starting live view client");

    let http = sync::http_client();

    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (graph_tx, graph_rx) = watch::channel(String::new());
    let (cursor_tx, cursor_rx) = watch::channel(CursorView::default());
    let (status_tx, status_rx) = watch::channel(DispatchStatus::default());
    let (input_tx, input_rx) = mpsc::channel(256);

    tokio::spawn(SyncClient::new(http.clone(), config.clone(), graph_tx, cursor_tx).run(signal_rx));
    tokio::spawn(ChangeBridge::new(http.clone(), config.clone(), cursor_rx.clone(), signal_tx).run());
    tokio::spawn(
        Renderer::new(
            GraphvizEngine::new(config.layout_program.clone(), config.graph_output.clone()),
            PrecisionController::new(config.render_target, config.precision_factor),
            config.render_cooldown,
            graph_rx,
        )
        .run(),
    );
    tokio::spawn(status::run(StatusLine::new(), cursor_rx, status_rx));
    let dispatcher = tokio::spawn(Dispatcher::new(http, config, status_tx).run(input_rx));

    enable_raw_mode()?;
    // Input is read on a dedicated thread; crossterm's blocking read does
    // not mix with the async runtime.
    let _input = thread::spawn(move || read_input(input_tx));

    // The dispatcher returns when the user quits.
    let _ = dispatcher.await;
    disable_raw_mode()?;
    println!();
    Ok(())
}

/// Accept bare host:port, prefer IPv4 for localhost, and require a base URL.
fn parse_server(server: &str) -> Result<Url, CliError> {
    let server = if server.contains("localhost") {
        server.replacen("localhost", "127.0.0.1", 1)
    } else {
        server.to_string()
    };
    let with_scheme = if server.starts_with("http://") || server.starts_with("https://") {
        server.clone()
    } else {
        format!("http://{server}")
    };
    let url = Url::parse(&with_scheme).map_err(|source| CliError::InvalidServer {
        server: server.clone(),
        source,
    })?;
    if url.cannot_be_a_base() {
        return Err(CliError::NotABase(server));
    }
    Ok(url)
}

fn read_input(tx: mpsc::Sender<InputEvent>) {
    loop {
        let event = match crossterm::event::read() {
            Ok(event) => event,
            Err(err) => {
                debug!(%err, "input read failed; stopping");
                let _ = tx.blocking_send(InputEvent::Quit);
                return;
            }
        };
        let Event::Key(key) = event else { continue };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let Some(input) = decode_key(key) else {
            continue;
        };
        let quit = input == InputEvent::Quit;
        if tx.blocking_send(input).is_err() || quit {
            return;
        }
    }
}

fn decode_key(key: KeyEvent) -> Option<InputEvent> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(InputEvent::Quit);
    }
    match key.code {
        KeyCode::Esc => Some(InputEvent::Cancel),
        KeyCode::Char('q') => Some(InputEvent::Quit),
        KeyCode::Char(c) if c.is_ascii_digit() => Some(InputEvent::Digit(c as u8 - b'0')),
        KeyCode::Char(c) => CommandKey::from_char(c).map(InputEvent::Command),
        _ => None,
    }
}
