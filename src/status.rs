//! One-line terminal feedback.
//!
//! The terminal is in raw mode while the client runs, so the status line
//! repaints in place instead of scrolling. It is the only thing the client
//! prints on stdout; logs go to stderr or a file.

use std::io::{self, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use tokio::sync::watch;

use crate::dispatch::DispatchStatus;
use crate::sync::CursorView;

#[derive(Debug, Clone, Default)]
pub struct StatusView {
    pub cursor: CursorView,
    pub dispatch: DispatchStatus,
}

pub fn format_status(view: &StatusView) -> String {
    let position = match view.cursor.position {
        Some(p) => format!("{}/{}/{}", p.epoch, p.block, p.commitment),
        None => "-".to_string(),
    };
    let state = if let Some(err) = &view.dispatch.error {
        format!("❌ {err}")
    } else if view.dispatch.idle() {
        "✅ idle".to_string()
    } else {
        format!(
            "⏳ {} pending / {} in flight",
            view.dispatch.pending, view.dispatch.in_flight
        )
    };
    let mut line = format!(
        "pos {position}  forgotten {}  │ {state}",
        view.cursor.forgotten
    );
    if let Some(root) = &view.dispatch.last_root {
        line.push_str(&format!("  │ root {root}"));
    }
    line
}

pub struct StatusLine {
    out: io::Stdout,
}

impl StatusLine {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }

    pub fn render(&mut self, view: &StatusView) -> io::Result<()> {
        queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        write!(self.out, "{}", format_status(view))?;
        self.out.flush()
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

/// Repaint whenever either the cursor or the dispatcher state changes.
pub async fn run(
    mut line: StatusLine,
    mut cursor_rx: watch::Receiver<CursorView>,
    mut dispatch_rx: watch::Receiver<DispatchStatus>,
) {
    loop {
        let view = StatusView {
            cursor: *cursor_rx.borrow_and_update(),
            dispatch: dispatch_rx.borrow_and_update().clone(),
        };
        if line.render(&view).is_err() {
            return;
        }
        tokio::select! {
            changed = cursor_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = dispatch_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
