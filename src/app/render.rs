use std::io;

use crossterm::{cursor, execute, cursor::MoveTo, style::Color, terminal::Clear, terminal::ClearType};

use crate::lifecycle::NodeState;
use crate::view::{Footer, NodeDetail, NodeRow, Presenter};

use super::App;
use super::state::StatusLevel;

fn level_color(level: StatusLevel) -> Color {
    match level {
        StatusLevel::Info => Color::Yellow,
        StatusLevel::Warning => Color::DarkYellow,
        StatusLevel::Error => Color::Red,
    }
}

pub fn render(app: &mut App) -> io::Result<()> {
    let time_str = chrono::Local::now().format("%H:%M:%S").to_string();
    let nodes = app.session.nodes();
    let rows: Vec<NodeRow> = nodes
        .iter()
        .map(|node| NodeRow {
            node,
            state: app.session.state(&node.name),
            busy: app.session.is_busy(&node.name),
        })
        .collect();
    let running = rows.iter().filter(|r| r.state == Some(NodeState::Running)).count();

    let detail = app.session.active().map(|name| NodeDetail {
        name,
        state: app.session.state(name),
        identity: app.session.identity(),
        uptime: app.session.uptime(),
        window: app.session.window(name),
    });

    let feed = app.feed.lock();
    let footer = Footer {
        status: feed.message.as_ref().map(|(msg, level)| (msg.as_str(), level_color(*level))),
        pull: feed.pull,
        details: &feed.details,
    };

    let mut out = io::stdout();
    execute!(out, cursor::Hide, Clear(ClearType::All), MoveTo(0, 0))?;
    Presenter::render_header(&mut out, &app.target, &app.image, rows.len(), running, &time_str)?;
    Presenter::render_nodes(&rows, app.selected_index(), detail.as_ref(), &footer)?;
    Ok(())
}
