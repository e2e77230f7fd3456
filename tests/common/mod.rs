//! Scripted container engine shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use edgefleet::config::SessionConfig;
use edgefleet::control::ControlChannel;
use edgefleet::engine::{CommandRunner, Engine, EngineOutput};
use edgefleet::lifecycle::{Lifecycle, NodeState};
use edgefleet::registry::NodeRegistry;
use edgefleet::session::{Coordinator, SessionObserver};
use edgefleet::updater::UpdateCheck;
use edgefleet::{Error, Result};
use tokio::runtime::Handle;

pub const IMAGE: &str = "ratio1/edge_node:mainnet";
pub const DATA_PATH: &str = "/edge_node/_local_cache";

type Responder = dyn Fn(&str) -> EngineOutput + Send + Sync;

/// Answers each command line (without the program name) from a closure and
/// records everything it was asked to run.
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    responder: Box<Responder>,
    slow: Option<(String, Duration)>,
}

impl FakeEngine {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> EngineOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            slow: None,
        })
    }

    /// Commands mentioning `needle` answer only after `delay`.
    pub fn with_slow<F>(needle: &str, delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> EngineOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            slow: Some((needle.to_string(), delay)),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn engine(self: &Arc<Self>) -> Engine {
        Engine::new(Arc::clone(self) as Arc<dyn CommandRunner>, "docker", Vec::new())
    }
}

#[async_trait]
impl CommandRunner for FakeEngine {
    async fn run(&self, argv: &[String], _stdin: Option<&[u8]>, _timeout: Duration) -> Result<EngineOutput> {
        let line = argv[1..].join(" ");
        self.calls.lock().push(argv.join(" "));
        if let Some((needle, delay)) = &self.slow {
            if line.contains(needle.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        Ok((self.responder)(&line))
    }
}

#[derive(Default)]
pub struct Seen {
    pub states: Vec<(String, NodeState)>,
    pub aliases: Vec<(String, String)>,
    pub checks: Vec<(UpdateCheck, Vec<String>)>,
    pub errors: Vec<String>,
    pub added: Vec<String>,
}

pub struct Recorder(pub Arc<Mutex<Seen>>);

impl SessionObserver for Recorder {
    fn on_lifecycle_state(&mut self, node: &str, state: NodeState) {
        self.0.lock().states.push((node.to_string(), state));
    }
    fn on_alias_changed(&mut self, node: &str, alias: &str) {
        self.0.lock().aliases.push((node.to_string(), alias.to_string()));
    }
    fn on_image_check(&mut self, check: &UpdateCheck, candidates: &[String]) {
        self.0.lock().checks.push((check.clone(), candidates.to_vec()));
    }
    fn on_error(&mut self, _node: Option<&str>, error: &Error) {
        self.0.lock().errors.push(error.to_string());
    }
    fn on_node_added(&mut self, node: &edgefleet::registry::LogicalNode) {
        self.0.lock().added.push(node.name.clone());
    }
}

pub fn lifecycle(fake: &Arc<FakeEngine>) -> Lifecycle {
    Lifecycle::new(fake.engine(), IMAGE, DATA_PATH).with_amd64_platform(false)
}

pub fn session(fake: &Arc<FakeEngine>, registry: Arc<NodeRegistry>) -> (Coordinator, Arc<Mutex<Seen>>) {
    let mut session = Coordinator::new(
        Handle::current(),
        registry,
        lifecycle(fake),
        ControlChannel::new(fake.engine()),
        SessionConfig::default(),
    );
    let seen = Arc::new(Mutex::new(Seen::default()));
    session.subscribe(Box::new(Recorder(Arc::clone(&seen))));
    (session, seen)
}

/// Pump completions until `done` holds.
pub async fn settle(session: &mut Coordinator, done: impl Fn(&Coordinator) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(session) {
            session.pump_next().await;
        }
    })
    .await
    .expect("session did not settle");
}

pub fn node_info(address: &str, alias: &str) -> String {
    format!(
        r#"{{"address":"{}","alias":"{}","eth_address":"0x{}","version_long":"v2.5.1","version_short":"2.5","info":{{"whitelist":[]}}}}"#,
        address, alias, alias
    )
}
