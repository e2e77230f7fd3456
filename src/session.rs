//! The coordinator owns the selection, the per-node telemetry windows and the
//! node state cache, and is the only place that writes the registry.
//!
//! Engine work runs as tasks on the tokio runtime. Every task reports back
//! through one channel as a tagged [`Event`]; the owner of the coordinator
//! drains it with [`Coordinator::pump`] (or awaits it with
//! [`Coordinator::pump_next`]) on its own thread. Results tagged with a node
//! that is no longer selected are dropped there, in one place.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::control::{
    AllowedPeer, ControlChannel, ControlCommand, ControlReply, ControlResult, Identity, mirror_identity,
};
use crate::engine::RequestHandle;
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, NodeState};
use crate::naming;
use crate::pull::PullEvent;
use crate::registry::{LogicalNode, NodeRegistry};
use crate::telemetry::{PollSchedule, TelemetryWindow, samples_from_history};
use crate::updater::{self, UpdateCheck};

/// User-initiated changes to a node, serialized per node.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleOp {
    /// Create the container if needed and start it.
    Start,
    Stop,
    /// Remove the container; the volume always survives. With `keep_record`
    /// the registry entry stays so the slot can be started again.
    Remove { keep_record: bool },
    Rename(String),
}

impl LifecycleOp {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Remove { .. } => "remove",
            LifecycleOp::Rename(_) => "rename",
        }
    }
}

#[derive(Debug)]
pub struct LifecycleOutcome {
    pub state: NodeState,
    /// Fresh identity read back after the operation, if any.
    pub identity: Option<Identity>,
}

impl LifecycleOutcome {
    fn state(state: NodeState) -> Self {
        Self { state, identity: None }
    }
}

/// Completion of background work, routed back to the coordinator.
#[derive(Debug)]
pub enum Event {
    Control(ControlResult),
    States(Result<HashMap<String, NodeState>>),
    NodeAllocated(Result<(String, String)>),
    Lifecycle {
        node: String,
        op: LifecycleOp,
        result: Result<LifecycleOutcome>,
    },
    PullProgress(PullEvent),
    ImageChecked(Result<UpdateCheck>),
}

/// Receives session notifications. Every method defaults to doing nothing.
pub trait SessionObserver {
    fn on_telemetry(&mut self, _node: &str, _window: &TelemetryWindow) {}
    fn on_identity(&mut self, _node: &str, _identity: &Identity) {}
    fn on_lifecycle_state(&mut self, _node: &str, _state: NodeState) {}
    fn on_image_progress(&mut self, _event: &PullEvent) {}
    fn on_alias_changed(&mut self, _node: &str, _alias: &str) {}
    fn on_image_check(&mut self, _check: &UpdateCheck, _restart_candidates: &[String]) {}
    fn on_control_reply(&mut self, _node: &str, _reply: &ControlReply) {}
    fn on_node_added(&mut self, _node: &LogicalNode) {}
    fn on_error(&mut self, _node: Option<&str>, _error: &Error) {}
    fn on_launcher_update_due(&mut self) {}
}

fn emit<F>(observers: &mut [Box<dyn SessionObserver>], mut f: F)
where
    F: FnMut(&mut dyn SessionObserver),
{
    for observer in observers.iter_mut() {
        f(observer.as_mut());
    }
}

#[derive(Debug, Default)]
struct NodeQueue {
    busy: bool,
    pending: VecDeque<LifecycleOp>,
}

pub struct Coordinator {
    rt: Handle,
    registry: Arc<NodeRegistry>,
    lifecycle: Lifecycle,
    control: ControlChannel,
    config: SessionConfig,
    schedule: PollSchedule,

    active: Option<String>,
    identity: Option<Identity>,
    uptime: Option<String>,
    windows: HashMap<String, TelemetryWindow>,
    states: HashMap<String, NodeState>,
    queues: HashMap<String, NodeQueue>,
    in_flight: Vec<RequestHandle>,
    pending_adds: usize,
    refreshing_states: bool,
    checking_image: bool,
    pull_percent: Option<f64>,

    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
    observers: Vec<Box<dyn SessionObserver>>,
}

impl Coordinator {
    pub fn new(
        rt: Handle,
        registry: Arc<NodeRegistry>,
        lifecycle: Lifecycle,
        control: ControlChannel,
        config: SessionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let schedule = PollSchedule::new(&config, Instant::now());
        Self {
            rt,
            registry,
            lifecycle,
            control,
            config,
            schedule,
            active: None,
            identity: None,
            uptime: None,
            windows: HashMap::new(),
            states: HashMap::new(),
            queues: HashMap::new(),
            in_flight: Vec::new(),
            pending_adds: 0,
            refreshing_states: false,
            checking_image: false,
            pull_percent: None,
            tx,
            rx,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Identity shown for the selected node: live when running, cached otherwise.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn uptime(&self) -> Option<&str> {
        self.uptime.as_deref()
    }

    pub fn state(&self, node: &str) -> Option<NodeState> {
        self.states.get(node).copied()
    }

    pub fn window(&self, node: &str) -> Option<&TelemetryWindow> {
        self.windows.get(node)
    }

    pub fn is_busy(&self, node: &str) -> bool {
        self.queues
            .get(node)
            .is_some_and(|q| q.busy || !q.pending.is_empty())
    }

    pub fn pending_adds(&self) -> usize {
        self.pending_adds
    }

    pub fn pull_percent(&self) -> Option<f64> {
        self.pull_percent
    }

    /// Registered nodes ordered by what the user sees (alias, then name).
    pub fn nodes(&self) -> Vec<LogicalNode> {
        let mut nodes = self.registry.list();
        nodes.sort_by(|a, b| {
            a.display_name()
                .to_lowercase()
                .cmp(&b.display_name().to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        nodes
    }

    /// Change the selected node. Outstanding requests for the previous one are
    /// cancelled; anything that still arrives for it is dropped by tag.
    pub fn select(&mut self, node: Option<&str>) -> bool {
        if self.active.as_deref() == node {
            return false;
        }
        for handle in self.in_flight.drain(..) {
            handle.cancel();
        }
        self.active = node.map(str::to_string);
        self.identity = None;
        self.uptime = None;
        let Some(node) = node else {
            return true;
        };
        debug!("Selected {}", node);

        if let Some(record) = self.registry.get(node) {
            let identity = Identity::from_cache(&record);
            emit(&mut self.observers, |o| o.on_identity(node, &identity));
            self.identity = Some(identity);
        }
        if let Some(state) = self.states.get(node).copied() {
            emit(&mut self.observers, |o| o.on_lifecycle_state(node, state));
        }
        if let Some(window) = self.windows.get(node).filter(|w| !w.is_empty()) {
            emit(&mut self.observers, |o| o.on_telemetry(node, window));
        }
        self.schedule.poll_now();
        true
    }

    /// Start whatever the timers say is due. Returns true if anything started.
    pub fn tick(&mut self, now: Instant) -> bool {
        let due = self.schedule.due(now);
        if due.poll {
            self.refresh_states();
            self.poll_active();
        }
        if due.image_check && !self.registry.is_empty() {
            self.start_image_check();
        }
        if due.update_check {
            info!("Launcher update check due");
            emit(&mut self.observers, |o| o.on_launcher_update_due());
        }
        due.any()
    }

    /// Handle every completion that has already arrived.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.rx.try_recv() {
            changed |= self.handle_event(event);
        }
        changed
    }

    /// Wait for the next completion, then drain the rest.
    pub async fn pump_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                let changed = self.handle_event(event);
                self.pump() || changed
            }
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Control(result) => self.on_control(result),
            Event::States(Ok(states)) => self.on_states(states),
            Event::States(Err(e)) => {
                self.refreshing_states = false;
                warn!("Could not refresh node states: {}", e);
                false
            }
            Event::NodeAllocated(result) => self.on_allocated(result),
            Event::Lifecycle { node, op, result } => self.on_lifecycle(node, op, result),
            Event::PullProgress(event) => {
                if let PullEvent::Overall { percent, .. } = event {
                    self.pull_percent = Some(percent);
                }
                emit(&mut self.observers, |o| o.on_image_progress(&event));
                true
            }
            Event::ImageChecked(result) => {
                self.checking_image = false;
                self.pull_percent = None;
                match result {
                    Ok(check) => {
                        if check.updated {
                            info!("Image {} updated: {}", check.image, check.summary);
                        } else {
                            debug!("Image {} is up to date", check.image);
                        }
                        let candidates = updater::restart_candidates(&check, &self.states);
                        emit(&mut self.observers, |o| o.on_image_check(&check, &candidates));
                    }
                    Err(e) => warn!("Image check failed: {}", e),
                }
                true
            }
        }
    }

    /// Allocate a name and volume, register the node and queue its first start.
    pub fn request_add_node(&mut self) {
        self.pending_adds += 1;
        let engine = self.lifecycle.engine().clone();
        let registry = Arc::clone(&self.registry);
        let prefix = self.config.node_prefix.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let result = naming::allocate(&engine, &registry, &prefix).await;
            let _ = tx.send(Event::NodeAllocated(result));
        });
    }

    pub fn request(&mut self, node: &str, op: LifecycleOp) {
        debug!("Queued {} for {}", op.label(), node);
        self.queues.entry(node.to_string()).or_default().pending.push_back(op);
        self.start_next(node);
    }

    pub fn request_start(&mut self, node: &str) {
        self.request(node, LifecycleOp::Start);
    }

    pub fn request_stop(&mut self, node: &str) {
        self.request(node, LifecycleOp::Stop);
    }

    pub fn request_remove(&mut self, node: &str, keep_record: bool) {
        self.request(node, LifecycleOp::Remove { keep_record });
    }

    pub fn request_rename(&mut self, node: &str, alias: &str) {
        self.request(node, LifecycleOp::Rename(alias.trim().to_string()));
    }

    /// Send a control command to the selected node; the reply arrives through
    /// `on_control_reply`. False when nothing is selected.
    pub fn request_control(&mut self, command: ControlCommand) -> bool {
        let Some(node) = self.active.clone() else {
            return false;
        };
        self.dispatch(&node, command);
        true
    }

    /// Like `request_control`, but only for `node`, and only while it is still
    /// the selected node.
    pub fn request_control_for(&mut self, node: &str, command: ControlCommand) -> bool {
        if self.active.as_deref() != Some(node) {
            warn!("Not sending {} to {}: selection moved", command.name(), node);
            return false;
        }
        self.dispatch(node, command);
        true
    }

    pub fn request_allowed(&mut self) -> bool {
        self.request_control(ControlCommand::GetAllowed)
    }

    pub fn request_update_allowed(&mut self, peers: Vec<AllowedPeer>) -> bool {
        self.request_control(ControlCommand::UpdateAllowedBatch(peers))
    }

    pub fn request_startup_config(&mut self) -> bool {
        self.request_control(ControlCommand::GetStartupConfig)
    }

    pub fn request_config_app(&mut self) -> bool {
        self.request_control(ControlCommand::GetConfigApp)
    }

    /// Reset the address of `node`, which the user confirmed by name.
    pub fn request_reset_address(&mut self, node: &str) -> bool {
        self.request_control_for(node, ControlCommand::ResetAddress)
    }

    /// Run an image check now unless one is already running.
    pub fn request_image_check(&mut self) -> bool {
        self.start_image_check()
    }

    /// Cancel outstanding control requests. Lifecycle work is left to finish.
    pub fn shutdown(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.cancel();
        }
    }

    fn dispatch(&mut self, node: &str, command: ControlCommand) {
        self.in_flight.retain(|h| !h.is_finished());
        let tx = self.tx.clone();
        let handle = self.control.dispatch(&self.rt, node, command, move |result| {
            let _ = tx.send(Event::Control(result));
        });
        self.in_flight.push(handle);
    }

    fn poll_active(&mut self) {
        let Some(node) = self.active.clone() else {
            return;
        };
        if self.state(&node) != Some(NodeState::Running) {
            return;
        }
        self.dispatch(&node, ControlCommand::GetNodeInfo);
        self.dispatch(&node, ControlCommand::GetNodeHistory);
    }

    fn refresh_states(&mut self) {
        if self.refreshing_states {
            return;
        }
        let names = self.registry.names();
        if names.is_empty() {
            return;
        }
        self.refreshing_states = true;
        let lifecycle = self.lifecycle.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let result = lifecycle.states(&names).await;
            let _ = tx.send(Event::States(result));
        });
    }

    fn start_image_check(&mut self) -> bool {
        if self.checking_image {
            return false;
        }
        self.checking_image = true;
        let lifecycle = self.lifecycle.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let progress = tx.clone();
            let mut sink = move |event: PullEvent| {
                let _ = progress.send(Event::PullProgress(event));
            };
            let result = lifecycle.check_for_image_update(&mut sink).await;
            let _ = tx.send(Event::ImageChecked(result));
        });
        true
    }

    fn start_next(&mut self, node: &str) {
        let Some(queue) = self.queues.get_mut(node) else {
            return;
        };
        if queue.busy {
            return;
        }
        let Some(op) = queue.pending.pop_front() else {
            self.queues.remove(node);
            return;
        };
        queue.busy = true;
        info!("Running {} for {}", op.label(), node);

        let record = self.registry.get(node);
        let lifecycle = self.lifecycle.clone();
        let control = self.control.clone();
        let tx = self.tx.clone();
        let node = node.to_string();
        self.rt.spawn(async move {
            let result = run_op(&lifecycle, &control, &node, record, &op, &tx).await;
            let _ = tx.send(Event::Lifecycle { node, op, result });
        });
    }

    fn on_control(&mut self, result: ControlResult) -> bool {
        let ControlResult { node, command, result } = result;
        if self.active.as_deref() != Some(node.as_str()) {
            debug!("Dropping {} reply from {}: no longer selected", command.name(), node);
            return false;
        }
        match result {
            Ok(ControlReply::NodeInfo(info)) => {
                self.apply_identity(&node, Identity::from(&info));
                true
            }
            Ok(ControlReply::History(history)) => {
                if history.uptime.is_some() {
                    self.uptime = history.uptime.clone();
                }
                let capacity = self.config.window_size;
                let window = self
                    .windows
                    .entry(node.clone())
                    .or_insert_with(|| TelemetryWindow::new(capacity));
                let appended = window.merge(samples_from_history(&history));
                if appended > 0 {
                    emit(&mut self.observers, |o| o.on_telemetry(&node, window));
                }
                appended > 0
            }
            Ok(reply) => {
                emit(&mut self.observers, |o| o.on_control_reply(&node, &reply));
                true
            }
            Err(e) if command.is_telemetry() => {
                warn!("{} for {} failed: {}", command.name(), node, e);
                false
            }
            Err(e) => {
                emit(&mut self.observers, |o| o.on_error(Some(&node), &e));
                true
            }
        }
    }

    fn on_states(&mut self, states: HashMap<String, NodeState>) -> bool {
        self.refreshing_states = false;
        let mut changed = false;
        let mut active_started = false;
        for (node, state) in states {
            // an operation in flight reports its own outcome
            if self.queues.get(&node).is_some_and(|q| q.busy) {
                continue;
            }
            if self.states.get(&node) == Some(&state) {
                continue;
            }
            if state == NodeState::Running && self.active.as_deref() == Some(node.as_str()) {
                active_started = true;
            }
            emit(&mut self.observers, |o| o.on_lifecycle_state(&node, state));
            self.states.insert(node, state);
            changed = true;
        }
        if active_started {
            self.poll_active();
        }
        changed
    }

    fn on_allocated(&mut self, result: Result<(String, String)>) -> bool {
        self.pending_adds = self.pending_adds.saturating_sub(1);
        let (mut name, mut volume) = match result {
            Ok(allocated) => allocated,
            Err(e) => {
                warn!("Could not allocate a node name: {}", e);
                emit(&mut self.observers, |o| o.on_error(None, &e));
                return true;
            }
        };
        // two adds in quick succession see the same engine listing
        if self.registry.get(&name).is_some() {
            let mut taken = self.registry.names();
            taken.push(name.clone());
            name = naming::next_name(&self.config.node_prefix, taken.iter().map(String::as_str));
            volume = naming::volume_for(&name);
        }
        let node = LogicalNode::new(name.clone(), volume);
        if let Err(e) = self.registry.upsert(node.clone()) {
            warn!("Could not register {}: {}", name, e);
            emit(&mut self.observers, |o| o.on_error(Some(&name), &e));
            return true;
        }
        info!("Registered {} with volume {}", node.name, node.volume_name);
        self.states.insert(name.clone(), NodeState::Absent);
        emit(&mut self.observers, |o| o.on_node_added(&node));
        self.select(Some(&name));
        self.request_start(&name);
        true
    }

    fn on_lifecycle(&mut self, node: String, op: LifecycleOp, result: Result<LifecycleOutcome>) -> bool {
        self.pull_percent = None;
        if let Some(queue) = self.queues.get_mut(&node) {
            queue.busy = false;
        }
        match result {
            Ok(outcome) => {
                info!("{} of {} finished: {}", op.label(), node, outcome.state);
                match op {
                    LifecycleOp::Start => {
                        if let Err(e) = self.registry.touch_last_used(&node) {
                            warn!("Could not update last use of {}: {}", node, e);
                        }
                    }
                    LifecycleOp::Remove { keep_record: false } => self.forget(&node),
                    _ => {}
                }
                if let Some(identity) = outcome.identity {
                    self.apply_identity(&node, identity);
                }
                self.states.insert(node.clone(), outcome.state);
                emit(&mut self.observers, |o| o.on_lifecycle_state(&node, outcome.state));
                if outcome.state == NodeState::Running && self.active.as_deref() == Some(node.as_str()) {
                    self.schedule.poll_now();
                }
            }
            Err(e) => {
                warn!("{} of {} failed: {}", op.label(), node, e);
                emit(&mut self.observers, |o| o.on_error(Some(&node), &e));
            }
        }
        self.start_next(&node);
        true
    }

    fn forget(&mut self, node: &str) {
        match self.registry.remove(node) {
            Ok(Some(_)) => info!("Removed {} from the registry", node),
            Ok(None) => {}
            Err(e) => {
                warn!("Could not remove {} from the registry: {}", node, e);
                emit(&mut self.observers, |o| o.on_error(Some(node), &e));
            }
        }
        self.windows.remove(node);
        if self.active.as_deref() == Some(node) {
            self.select(None);
        }
    }

    fn apply_identity(&mut self, node: &str, identity: Identity) {
        match mirror_identity(&self.registry, node, &identity) {
            Ok(update) => {
                if let Some(alias) = update.alias_changed {
                    info!("{} is now known as {}", node, alias);
                    emit(&mut self.observers, |o| o.on_alias_changed(node, &alias));
                }
            }
            Err(e) => warn!("Could not cache identity of {}: {}", node, e),
        }
        if self.active.as_deref() == Some(node) {
            emit(&mut self.observers, |o| o.on_identity(node, &identity));
            self.identity = Some(identity);
        }
    }
}

async fn run_op(
    lifecycle: &Lifecycle,
    control: &ControlChannel,
    node: &str,
    record: Option<LogicalNode>,
    op: &LifecycleOp,
    tx: &UnboundedSender<Event>,
) -> Result<LifecycleOutcome> {
    match op {
        LifecycleOp::Start => {
            let record = record.ok_or_else(|| Error::NotFound {
                kind: "node",
                name: node.to_string(),
            })?;
            let mut sink = |event: PullEvent| {
                let _ = tx.send(Event::PullProgress(event));
            };
            lifecycle.create_and_start(&record, &mut sink).await?;
            Ok(LifecycleOutcome::state(NodeState::Running))
        }
        LifecycleOp::Stop => {
            lifecycle.stop(node).await?;
            let state = lifecycle.node_state(node).await.unwrap_or(NodeState::Stopped);
            Ok(LifecycleOutcome::state(state))
        }
        LifecycleOp::Remove { .. } => {
            lifecycle.remove(node, true).await?;
            Ok(LifecycleOutcome::state(NodeState::Absent))
        }
        LifecycleOp::Rename(alias) => {
            control.execute(node, &ControlCommand::ChangeAlias(alias.clone())).await?;
            let info = control.get_node_info(node).await?;
            Ok(LifecycleOutcome {
                state: NodeState::Running,
                identity: Some(Identity::from(&info)),
            })
        }
    }
}
