use std::io::{self, Write, stdout};
use crossterm::{cursor::{self, MoveTo}, queue, style::{Color, SetBackgroundColor, SetForegroundColor, SetAttribute, Attribute, ResetColor}, terminal};

pub fn render_confirmation(prompt: &str) -> io::Result<()> {
    let line = format!("  {} (y to confirm, any other key to cancel)  ", prompt);
    render_bar(&line, Color::DarkRed)
}

/// Single-line text entry above the footer.
pub fn render_input(label: &str, buffer: &str) -> io::Result<()> {
    let line = format!("  {}: {}", label, buffer);
    render_bar(&line, Color::DarkBlue)?;
    let size = terminal::size()?;
    let x = (line.chars().count() as u16).min(size.0.saturating_sub(1));
    let mut out = stdout();
    queue!(out, cursor::MoveTo(x, size.1.saturating_sub(3)), cursor::Show)?;
    out.flush()
}

fn render_bar(line: &str, background: Color) -> io::Result<()> {
    let mut out = stdout();
    let size = terminal::size()?;
    let y = size.1.saturating_sub(3);
    let width = size.0 as usize;

    queue!(out, MoveTo(0, y))?;
    queue!(out, SetBackgroundColor(background), SetForegroundColor(Color::White), SetAttribute(Attribute::Bold))?;
    write!(out, "{:<width$}", line, width = width)?;
    queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;
    out.flush()?;
    Ok(())
}
