mod shared;
mod header;
mod nodes;
mod confirmation;

use std::io::{self, Write};
use crossterm::{execute, cursor, queue, style::{Color, SetForegroundColor, ResetColor}, terminal};

pub use shared::{format_optional, progress_bar, short_address, sparkline, truncate_str};
pub use nodes::{Footer, NodeDetail, NodeRow};

pub struct Presenter;

/// Minimum terminal dimensions for usable rendering.
pub const MIN_COLS: u16 = 80;
pub const MIN_ROWS: u16 = 16;

impl Presenter {
    /// Check if the terminal is large enough. If not, render a "too small"
    /// message and return `true` (meaning "skip normal rendering").
    pub fn render_size_guard() -> io::Result<bool> {
        let (cols, rows) = terminal::size()?;
        if cols < MIN_COLS || rows < MIN_ROWS {
            let mut out = std::io::stdout();
            execute!(out, terminal::Clear(terminal::ClearType::All), cursor::MoveTo(0, 0))?;
            let msg = format!(
                "Terminal too small ({}x{}). Resize to at least {}x{}.",
                cols, rows, MIN_COLS, MIN_ROWS
            );
            let y = rows / 2;
            let x = cols.saturating_sub(msg.len() as u16) / 2;
            queue!(out, cursor::MoveTo(x, y), SetForegroundColor(Color::Yellow))?;
            write!(out, "{}", msg)?;
            queue!(out, ResetColor)?;
            out.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn render_header(
        out: &mut impl Write,
        target: &str,
        image: &str,
        node_count: usize,
        running: usize,
        time: &str,
    ) -> io::Result<()> {
        header::render_header(out, target, image, node_count, running, time)
    }

    pub fn render_nodes(
        rows: &[NodeRow],
        selected: Option<usize>,
        detail: Option<&NodeDetail>,
        footer: &Footer,
    ) -> io::Result<()> {
        nodes::render_nodes(rows, selected, detail, footer)
    }

    pub fn render_confirmation(prompt: &str) -> io::Result<()> {
        confirmation::render_confirmation(prompt)
    }

    pub fn render_input(label: &str, buffer: &str) -> io::Result<()> {
        confirmation::render_input(label, buffer)
    }
}
