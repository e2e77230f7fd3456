use std::io::{self, Write, stdout};
use crossterm::{cursor, queue, style::{Color, SetForegroundColor, ResetColor, SetAttribute, Attribute}};

use crate::control::Identity;
use crate::lifecycle::NodeState;
use crate::registry::LogicalNode;
use crate::telemetry::TelemetryWindow;
use super::shared::{format_optional, progress_bar, short_address, sparkline, truncate_str, write_section_header, write_selectable, writeln};

pub struct NodeRow<'a> {
    pub node: &'a LogicalNode,
    pub state: Option<NodeState>,
    pub busy: bool,
}

/// Everything shown about the selected node.
pub struct NodeDetail<'a> {
    pub name: &'a str,
    pub state: Option<NodeState>,
    pub identity: Option<&'a Identity>,
    pub uptime: Option<&'a str>,
    pub window: Option<&'a TelemetryWindow>,
}

pub struct Footer<'a> {
    pub status: Option<(&'a str, Color)>,
    pub pull: Option<(f64, usize)>,
    pub details: &'a [String],
}

const HELP: &str = "q: Quit | ↑/↓: Select | a: Add | s: Start | t: Stop | d: Remove | D: Remove, keep record | r: Rename | w: Allowed | c/C: Config | R: Reset address | i: Image check";

fn state_color(state: Option<NodeState>) -> Color {
    match state {
        Some(NodeState::Running) => Color::Green,
        Some(NodeState::Stopped) => Color::Yellow,
        Some(NodeState::Absent) => Color::DarkGrey,
        None => Color::Grey,
    }
}

pub fn render_nodes(
    rows: &[NodeRow],
    selected: Option<usize>,
    detail: Option<&NodeDetail>,
    footer: &Footer,
) -> io::Result<()> {
    let mut out = stdout();
    queue!(out, cursor::MoveTo(0, 2))?;
    let size = crossterm::terminal::size()?;

    if rows.is_empty() {
        writeln(&mut out, "")?;
        writeln(&mut out, "  No nodes registered yet.")?;
        writeln(&mut out, "")?;
        writeln(&mut out, "  Press 'a' to create one.")?;
    } else {
        queue!(io::stdout(), SetAttribute(Attribute::Bold))?;
        write!(out, "  {:<16} {:<22} {:<9} {:<16} {}", "NAME", "ALIAS", "STATE", "ADDRESS", "LAST USED")?;
        queue!(io::stdout(), SetAttribute(Attribute::Reset))?;
        write!(out, "\r\n")?;

        for (idx, row) in rows.iter().enumerate() {
            let state = match (row.busy, row.state) {
                (true, _) => "BUSY".to_string(),
                (false, Some(s)) => s.label().to_string(),
                (false, None) => "?".to_string(),
            };
            let line = format!(
                "  {:<16} {:<22} {:<9} {:<16} {}",
                truncate_str(&row.node.name, 16),
                truncate_str(row.node.cached_alias.as_deref().unwrap_or("-"), 22),
                state,
                short_address(row.node.cached_node_address.as_deref().unwrap_or("-"), 16),
                row.node.last_used_at.format("%Y-%m-%d %H:%M"),
            );
            let is_selected = selected == Some(idx);
            if !is_selected {
                queue!(io::stdout(), SetForegroundColor(state_color(row.state)))?;
            }
            write_selectable(&mut out, &line, is_selected)?;
            queue!(io::stdout(), ResetColor)?;
        }
    }

    if let Some(detail) = detail {
        writeln(&mut out, "")?;
        render_detail(&mut out, detail)?;
    }

    if let Some((percent, layers)) = footer.pull {
        writeln(&mut out, "")?;
        writeln(&mut out, &format!("  Pulling image {} {:>5.1}% ({} layers)", progress_bar(percent, 30), percent, layers))?;
    }

    if !footer.details.is_empty() {
        writeln(&mut out, "")?;
        let room = (size.1 as usize).saturating_sub(24).max(3);
        for line in footer.details.iter().take(room) {
            writeln(&mut out, &format!("    {}", truncate_str(line, (size.0 as usize).saturating_sub(6))))?;
        }
        if footer.details.len() > room {
            writeln(&mut out, &format!("    ... {} more", footer.details.len() - room))?;
        }
    }

    if let Some((msg, color)) = footer.status {
        writeln(&mut out, "")?;
        queue!(io::stdout(), SetForegroundColor(color))?;
        writeln(&mut out, &format!("  {}", msg))?;
        queue!(io::stdout(), ResetColor)?;
    }

    let help_y = size.1.saturating_sub(1);
    let width = (size.0 as usize).saturating_sub(2);
    queue!(
        out,
        cursor::MoveTo(1, help_y),
        SetForegroundColor(Color::DarkGrey),
        crossterm::style::Print(format!("{:<width$}", truncate_str(HELP, width), width = width)),
        ResetColor
    )?;

    out.flush()?;
    Ok(())
}

fn render_detail(out: &mut impl Write, detail: &NodeDetail) -> io::Result<()> {
    let state = detail.state.map(NodeState::label).unwrap_or("UNKNOWN");
    write_section_header(out, &format!("  {} [{}]", detail.name, state))?;

    let empty = Identity::default();
    let identity = detail.identity.unwrap_or(&empty);
    let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
    writeln(out, &format!("    Alias:    {}", or_dash(&identity.alias)))?;
    writeln(out, &format!("    Address:  {}", or_dash(&identity.node_address)))?;
    writeln(out, &format!("    ETH:      {}", or_dash(&identity.eth_address)))?;
    if !identity.whitelist.is_empty() {
        writeln(out, &format!("    Allowed:  {} peers", identity.whitelist.len()))?;
    }

    if detail.state != Some(NodeState::Running) {
        return Ok(());
    }
    if let Some(uptime) = detail.uptime {
        writeln(out, &format!("    Uptime:   {}", uptime))?;
    }
    let Some(window) = detail.window.filter(|w| !w.is_empty()) else {
        writeln(out, "    Waiting for telemetry...")?;
        return Ok(());
    };
    if let Some(latest) = window.latest() {
        let memory = match latest.total_memory {
            Some(total) => format!("{:.1}/{:.1} GB", latest.occupied_memory, total),
            None => format!("{:.1} GB", latest.occupied_memory),
        };
        writeln(out, &format!("    CPU:      {:.1}%   Memory: {}", latest.cpu_load, memory))?;
        if latest.gpu_load.is_some() || latest.gpu_occupied_memory.is_some() {
            writeln(
                out,
                &format!(
                    "    GPU:      {}   GPU memory: {}",
                    format_optional(latest.gpu_load, "%"),
                    format_optional(latest.gpu_occupied_memory, " GB")
                ),
            )?;
        }
        if let Some(epoch) = latest.current_epoch {
            writeln(
                out,
                &format!("    Epoch:    {}  availability {}", epoch, format_optional(latest.current_epoch_avail.map(|a| a * 100.0), "%")),
            )?;
        }
        if let Some(version) = &latest.version {
            writeln(out, &format!("    Version:  {}", version))?;
        }
    }
    let cpu: Vec<f64> = window.samples().map(|s| s.cpu_load).collect();
    queue!(io::stdout(), SetForegroundColor(Color::Cyan))?;
    writeln(out, &format!("    CPU {}  ({} samples)", sparkline(&cpu, 100.0), window.len()))?;
    queue!(io::stdout(), ResetColor)?;
    Ok(())
}
