use std::time::Instant;

use super::App;

impl App {
    /// Let the session start whatever its timers say is due.
    pub fn process_tick(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) < self.tick_rate {
            return false;
        }
        self.last_tick = now;
        self.session.tick(now)
    }

    /// Drain completed background work.
    pub fn poll_session(&mut self) -> bool {
        let changed = self.session.pump();
        let dirty = self.feed.lock().take_dirty();
        changed || dirty
    }

    /// Keep a node selected while any exist.
    pub fn sync_selection(&mut self) -> bool {
        let nodes = self.session.nodes();
        match self.session.active() {
            Some(active) if nodes.iter().any(|n| n.name == active) => false,
            _ => {
                let first = nodes.first().map(|n| n.name.clone());
                self.session.select(first.as_deref())
            }
        }
    }

    /// Position of the selected node in display order.
    pub fn selected_index(&self) -> Option<usize> {
        let active = self.session.active()?;
        self.session.nodes().iter().position(|n| n.name == active)
    }

    /// Move the selection by `delta` rows, clamped to the list.
    pub fn move_selection(&mut self, delta: isize) -> bool {
        let nodes = self.session.nodes();
        if nodes.is_empty() {
            return false;
        }
        let current = self.selected_index().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, nodes.len() as isize - 1) as usize;
        self.session.select(Some(&nodes[next].name))
    }

    /// Expire pending confirmation if timed out.
    pub fn expire_pending_action(&mut self) -> bool {
        let now = Instant::now();
        if let Some(ref pa) = self.pending_action {
            if now > pa.expires {
                self.pending_action = None;
                return true;
            }
        }
        false
    }
}
