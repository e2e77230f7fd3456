use std::io::{self, Write};
use crossterm::{queue, style::{Color, SetForegroundColor, SetBackgroundColor, ResetColor, Attribute, SetAttribute}};

/// Truncate a string to at most `max_len` characters (not bytes), appending "..."
/// if truncated. Safe for multi-byte UTF-8.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let keep = max_len.saturating_sub(3);
        let truncated: String = s.chars().take(keep).collect();
        format!("{}...", truncated)
    }
}

/// Shorten a long address to `head…tail` so both ends stay recognisable.
pub fn short_address(address: &str, max_len: usize) -> String {
    let count = address.chars().count();
    if count <= max_len || max_len < 7 {
        return truncate_str(address, max_len);
    }
    let side = (max_len - 1) / 2;
    let head: String = address.chars().take(side).collect();
    let tail: String = address.chars().skip(count - side).collect();
    format!("{}…{}", head, tail)
}

pub fn writeln(out: &mut impl Write, text: &str) -> io::Result<()> {
    write!(out, "{}\r\n", text)
}

pub fn write_section_header(out: &mut impl Write, text: &str) -> io::Result<()> {
    queue!(io::stdout(), SetAttribute(Attribute::Bold))?;
    write!(out, "{}\r\n", text)?;
    queue!(io::stdout(), ResetColor, SetAttribute(Attribute::Reset))?;
    Ok(())
}

pub fn write_selectable(out: &mut impl Write, text: &str, selected: bool) -> io::Result<()> {
    if selected {
        queue!(io::stdout(), SetBackgroundColor(Color::DarkGrey), SetForegroundColor(Color::White))?;
    }
    write!(out, "{}\r\n", text)?;
    if selected {
        queue!(io::stdout(), ResetColor)?;
    }
    Ok(())
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let filled = (((percent / 100.0) * width as f64).round() as usize).min(width);
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// One block character per value, scaled to `max`.
pub fn sparkline(values: &[f64], max: f64) -> String {
    const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    if max <= 0.0 {
        return BLOCKS[0].to_string().repeat(values.len());
    }
    values
        .iter()
        .map(|v| {
            let level = ((v / max).clamp(0.0, 1.0) * (BLOCKS.len() - 1) as f64).round() as usize;
            BLOCKS[level]
        })
        .collect()
}

pub fn format_optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "n/a".to_string(),
    }
}
