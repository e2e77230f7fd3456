use std::io::{self, Write};
use crossterm::{
    cursor, queue,
    style::{Color, SetForegroundColor, SetBackgroundColor, ResetColor},
    terminal,
};

pub fn render_header(
    out: &mut impl Write,
    target: &str,
    image: &str,
    node_count: usize,
    running: usize,
    time: &str,
) -> io::Result<()> {
    write!(out, "  ")?;
    queue!(io::stdout(), SetBackgroundColor(Color::DarkBlue), SetForegroundColor(Color::White))?;
    write!(out, " Nodes ({} / {} running) ", node_count, running)?;
    queue!(io::stdout(), ResetColor)?;

    queue!(io::stdout(), SetForegroundColor(Color::DarkGrey))?;
    write!(out, "  engine: {}  image: {}", target, image)?;
    queue!(io::stdout(), ResetColor)?;

    // Right-align the time
    let size = terminal::size()?;
    let time_str = format!("edgefleet - {} ", time);
    let col = (size.0 as usize).saturating_sub(time_str.len());
    queue!(io::stdout(), cursor::MoveTo(col as u16, 0))?;
    queue!(io::stdout(), SetForegroundColor(Color::DarkGrey))?;
    write!(out, "{}", time_str)?;
    queue!(io::stdout(), ResetColor)?;

    write!(out, "\r\n")?;
    let sep: String = "─".repeat(size.0 as usize);
    queue!(io::stdout(), SetForegroundColor(Color::DarkGrey))?;
    write!(out, "{}\r\n", sep)?;
    queue!(io::stdout(), ResetColor)?;

    Ok(())
}
