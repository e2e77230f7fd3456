use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::control::{ControlReply, Identity};
use crate::error::Error;
use crate::lifecycle::NodeState;
use crate::pull::PullEvent;
use crate::registry::LogicalNode;
use crate::session::SessionObserver;
use crate::telemetry::TelemetryWindow;
use crate::updater::UpdateCheck;

/// How long a confirmation prompt stays open.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending destructive action awaiting confirmation.
pub struct PendingAction {
    pub description: String,
    pub kind: PendingActionKind,
    pub expires: Instant,
}

impl PendingAction {
    pub fn new(kind: PendingActionKind) -> Self {
        let description = match &kind {
            PendingActionKind::Stop(node) => format!("Stop {}?", node),
            PendingActionKind::Remove { node, keep_record: true } => {
                format!("Remove container {} (volume and record kept)?", node)
            }
            PendingActionKind::Remove { node, keep_record: false } => {
                format!("Remove {} and forget it (volume kept)?", node)
            }
            PendingActionKind::ResetAddress(node) => format!("Reset the address of {}?", node),
        };
        Self {
            description,
            kind,
            expires: Instant::now() + CONFIRM_TIMEOUT,
        }
    }
}

pub enum PendingActionKind {
    Stop(String),
    Remove { node: String, keep_record: bool },
    ResetAddress(String),
}

/// Inline text entry, currently only used for renaming.
pub struct TextInput {
    pub node: String,
    pub buffer: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// What the session has told the front end since the last frame.
#[derive(Default)]
pub struct StatusFeed {
    pub message: Option<(String, StatusLevel)>,
    /// Overall pull percent and layer count while a pull is running.
    pub pull: Option<(f64, usize)>,
    /// Lines of the last allowed-list or config reply.
    pub details: Vec<String>,
    pub dirty: bool,
}

impl StatusFeed {
    pub fn set(&mut self, level: StatusLevel, message: impl Into<String>) {
        self.message = Some((message.into(), level));
        self.dirty = true;
    }

    /// True once per batch of changes.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Adapts session notifications to the shared status feed.
pub struct FeedObserver(pub Arc<Mutex<StatusFeed>>);

impl SessionObserver for FeedObserver {
    fn on_telemetry(&mut self, _node: &str, _window: &TelemetryWindow) {
        self.0.lock().dirty = true;
    }

    fn on_identity(&mut self, _node: &str, _identity: &Identity) {
        self.0.lock().dirty = true;
    }

    fn on_lifecycle_state(&mut self, node: &str, state: NodeState) {
        let mut feed = self.0.lock();
        feed.pull = None;
        feed.set(StatusLevel::Info, format!("{} is {}", node, state));
    }

    fn on_image_progress(&mut self, event: &PullEvent) {
        let mut feed = self.0.lock();
        match event {
            PullEvent::Overall { percent, layers } => feed.pull = Some((*percent, *layers)),
            PullEvent::Started { reference } => feed.set(StatusLevel::Info, reference.clone()),
            _ => {}
        }
        feed.dirty = true;
    }

    fn on_alias_changed(&mut self, node: &str, alias: &str) {
        self.0.lock().set(StatusLevel::Info, format!("{} is now \"{}\"", node, alias));
    }

    fn on_image_check(&mut self, check: &UpdateCheck, restart_candidates: &[String]) {
        let mut feed = self.0.lock();
        feed.pull = None;
        if check.updated {
            let hint = if restart_candidates.is_empty() {
                String::new()
            } else {
                format!("; restart {} to apply", restart_candidates.join(", "))
            };
            feed.set(StatusLevel::Warning, format!("New image {}{}", check.image, hint));
        } else {
            feed.dirty = true;
        }
    }

    fn on_control_reply(&mut self, node: &str, reply: &ControlReply) {
        let mut feed = self.0.lock();
        let (summary, details) = describe_reply(reply);
        feed.details = details;
        feed.set(StatusLevel::Info, format!("{}: {}", node, summary));
    }

    fn on_node_added(&mut self, node: &LogicalNode) {
        self.0.lock().set(
            StatusLevel::Info,
            format!("Added {} (volume {})", node.name, node.volume_name),
        );
    }

    fn on_error(&mut self, node: Option<&str>, error: &Error) {
        let mut text = match node {
            Some(node) => format!("{}: {}", node, error),
            None => error.to_string(),
        };
        if let Some(hint) = error.hint() {
            text.push_str(" (");
            text.push_str(hint);
            text.push(')');
        }
        let mut feed = self.0.lock();
        feed.pull = None;
        feed.set(StatusLevel::Error, text);
    }

    fn on_launcher_update_due(&mut self) {
        self.0
            .lock()
            .set(StatusLevel::Info, "Time to check for a newer edgefleet release");
    }
}

/// Status line plus detail lines for a control reply.
pub fn describe_reply(reply: &ControlReply) -> (String, Vec<String>) {
    match reply {
        ControlReply::Allowed(peers) => (
            format!("{} allowed peers", peers.len()),
            peers
                .iter()
                .map(|p| format!("{}  {}", p.address, p.alias))
                .collect(),
        ),
        ControlReply::AllowedUpdated => ("allowed list updated".to_string(), Vec::new()),
        ControlReply::AliasChanged(out) => (format!("alias changed {}", out), Vec::new()),
        ControlReply::AddressReset(out) => (format!("address reset {}", out), Vec::new()),
        ControlReply::StartupConfig(config) | ControlReply::ConfigApp(config) => (
            format!("{} config keys", config.len()),
            config.iter().map(|(k, v)| format!("{} = {}", k, v)).collect(),
        ),
        ControlReply::NodeInfo(info) => (info.version_short.clone(), Vec::new()),
        ControlReply::History(history) => (format!("{} samples", history.timestamps.len()), Vec::new()),
    }
}
