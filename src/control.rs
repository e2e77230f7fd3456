//! Request/response protocol with the administrative CLI inside a node.
//!
//! Commands run as `exec <container> <cmd> [args…]`. Structured replies are
//! single JSON documents decoded into closed record types; everything else is
//! line-oriented text.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::debug;

use crate::engine::{Engine, EngineOutput, RequestHandle};
use crate::error::{Error, Result};
use crate::registry::{LogicalNode, NodeRegistry};

/// Reply of `get_node_info`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub alias: String,
    pub eth_address: String,
    pub version_long: String,
    pub version_short: String,
    pub info: NodeInfoDetails,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NodeInfoDetails {
    pub whitelist: Vec<String>,
}

/// Who a node says it is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Identity {
    pub node_address: String,
    pub eth_address: String,
    pub alias: String,
    pub whitelist: BTreeSet<String>,
}

impl From<&NodeInfo> for Identity {
    fn from(info: &NodeInfo) -> Self {
        Self {
            node_address: info.address.clone(),
            eth_address: info.eth_address.clone(),
            alias: info.alias.clone(),
            whitelist: info.info.whitelist.iter().cloned().collect(),
        }
    }
}

impl Identity {
    /// Last identity mirrored into the registry, for nodes that are not running.
    pub fn from_cache(node: &LogicalNode) -> Self {
        Self {
            node_address: node.cached_node_address.clone().unwrap_or_default(),
            eth_address: node.cached_eth_address.clone().unwrap_or_default(),
            alias: node.cached_alias.clone().unwrap_or_default(),
            whitelist: BTreeSet::new(),
        }
    }
}

/// Reply of `get_node_history`. Series are index-aligned with `timestamps`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct NodeHistory {
    #[serde(deserialize_with = "timestamps")]
    pub timestamps: Vec<String>,
    #[serde(default)]
    pub cpu_load: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub occupied_memory: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub total_memory: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub gpu_load: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub gpu_occupied_memory: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub gpu_total_memory: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub cpu_temp: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub gpu_temp: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub epoch_avail: Option<f64>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub uptime: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Number(n) => n.to_string(),
        }
    }
}

fn timestamps<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    let raw = Vec::<Scalar>::deserialize(d)?;
    Ok(raw.into_iter().map(Scalar::into_text).collect())
}

fn scalar_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_text))
}

/// A series with no values at all means the node has no such sensor.
fn absent_if_null(series: Option<Vec<Option<f64>>>) -> Option<Vec<Option<f64>>> {
    series.filter(|values| values.iter().any(Option::is_some))
}

impl NodeHistory {
    fn normalized(mut self) -> Self {
        self.gpu_load = absent_if_null(self.gpu_load);
        self.gpu_occupied_memory = absent_if_null(self.gpu_occupied_memory);
        self.gpu_total_memory = absent_if_null(self.gpu_total_memory);
        self.gpu_temp = absent_if_null(self.gpu_temp);
        self.cpu_temp = absent_if_null(self.cpu_temp);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedPeer {
    pub address: String,
    pub alias: String,
}

/// One peer per non-blank line: `<address> <alias with spaces>`, `#` starts a comment.
pub fn parse_allowed(text: &str) -> Vec<AllowedPeer> {
    text.lines()
        .filter_map(|line| {
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => line,
            }
            .trim();
            if line.is_empty() {
                return None;
            }
            let (address, alias) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            Some(AllowedPeer {
                address: address.to_string(),
                alias: alias.trim().to_string(),
            })
        })
        .collect()
}

/// Wire form for `update_allowed_batch`: one line per peer plus a final newline.
pub fn format_allowed(peers: &[AllowedPeer]) -> String {
    let mut out = String::new();
    for peer in peers {
        out.push_str(peer.address.trim());
        out.push(' ');
        out.push_str(peer.alias.trim());
        out.push('\n');
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    GetNodeInfo,
    GetNodeHistory,
    GetAllowed,
    UpdateAllowedBatch(Vec<AllowedPeer>),
    ChangeAlias(String),
    ResetAddress,
    GetStartupConfig,
    GetConfigApp,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::GetNodeInfo => "get_node_info",
            ControlCommand::GetNodeHistory => "get_node_history",
            ControlCommand::GetAllowed => "get_allowed",
            ControlCommand::UpdateAllowedBatch(_) => "update_allowed_batch",
            ControlCommand::ChangeAlias(_) => "change_alias",
            ControlCommand::ResetAddress => "reset_address",
            ControlCommand::GetStartupConfig => "get_startup_config",
            ControlCommand::GetConfigApp => "get_config_app",
        }
    }

    /// Polling commands whose failures are only logged.
    pub fn is_telemetry(&self) -> bool {
        matches!(self, ControlCommand::GetNodeInfo | ControlCommand::GetNodeHistory)
    }

    pub fn exec_args(&self, container: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if self.stdin().is_some() {
            args.push("-i".to_string());
        }
        args.push(container.to_string());
        args.push(self.name().to_string());
        if let ControlCommand::ChangeAlias(alias) = self {
            args.push(alias.clone());
        }
        args
    }

    pub fn stdin(&self) -> Option<String> {
        match self {
            ControlCommand::UpdateAllowedBatch(peers) => Some(format_allowed(peers)),
            _ => None,
        }
    }

    /// Decode a successful reply.
    pub fn parse_reply(&self, stdout: &str) -> Result<ControlReply> {
        let reply = match self {
            ControlCommand::GetNodeInfo => ControlReply::NodeInfo(decode(self.name(), stdout)?),
            ControlCommand::GetNodeHistory => {
                let history: NodeHistory = decode(self.name(), stdout)?;
                ControlReply::History(history.normalized())
            }
            ControlCommand::GetAllowed => ControlReply::Allowed(parse_allowed(stdout)),
            ControlCommand::UpdateAllowedBatch(_) => ControlReply::AllowedUpdated,
            ControlCommand::ChangeAlias(_) => ControlReply::AliasChanged(stdout.trim().to_string()),
            ControlCommand::ResetAddress => ControlReply::AddressReset(stdout.trim().to_string()),
            ControlCommand::GetStartupConfig => {
                let mut config: Map<String, Value> = decode(self.name(), stdout)?;
                config.retain(|key, _| !key.starts_with('#'));
                ControlReply::StartupConfig(config)
            }
            ControlCommand::GetConfigApp => ControlReply::ConfigApp(decode(self.name(), stdout)?),
        };
        Ok(reply)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(context: &str, stdout: &str) -> Result<T> {
    serde_json::from_str(stdout.trim()).map_err(|e| Error::parse(context, e, stdout))
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlReply {
    NodeInfo(NodeInfo),
    History(NodeHistory),
    Allowed(Vec<AllowedPeer>),
    AllowedUpdated,
    AliasChanged(String),
    AddressReset(String),
    StartupConfig(Map<String, Value>),
    ConfigApp(Map<String, Value>),
}

/// A completed request, tagged with the node it was issued for.
#[derive(Debug)]
pub struct ControlResult {
    pub node: String,
    pub command: ControlCommand,
    pub result: Result<ControlReply>,
}

fn interpret(node: &str, command: &ControlCommand, output: EngineOutput) -> Result<ControlReply> {
    if !output.success() && output.reports_missing() {
        return Err(Error::NotFound {
            kind: "container",
            name: node.to_string(),
        });
    }
    let output = output.check(&format!("exec {} {}", node, command.name()))?;
    command.parse_reply(&output.stdout)
}

#[derive(Clone)]
pub struct ControlChannel {
    engine: Engine,
}

impl ControlChannel {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn execute(&self, node: &str, command: &ControlCommand) -> Result<ControlReply> {
        let args = command.exec_args(node);
        let stdin = command.stdin();
        let output = self.engine.run_with(args.as_slice(), stdin.as_deref(), None).await?;
        interpret(node, command, output)
    }

    /// Fire-and-forget through the engine's async primitive; `deliver` gets the
    /// tagged result on a runtime worker.
    pub fn dispatch<F>(&self, handle: &Handle, node: &str, command: ControlCommand, deliver: F) -> RequestHandle
    where
        F: FnOnce(ControlResult) + Send + 'static,
    {
        let args = command.exec_args(node);
        let stdin = command.stdin();
        let node = node.to_string();
        debug!("dispatch {} to {}", command.name(), node);
        self.engine.run_async(handle, args, stdin, None, move |output| {
            let result = output.and_then(|out| interpret(&node, &command, out));
            deliver(ControlResult {
                node,
                command,
                result,
            });
        })
    }

    pub async fn get_node_info(&self, node: &str) -> Result<NodeInfo> {
        match self.execute(node, &ControlCommand::GetNodeInfo).await? {
            ControlReply::NodeInfo(info) => Ok(info),
            other => Err(unexpected("get_node_info", &other)),
        }
    }

    pub async fn get_allowed(&self, node: &str) -> Result<Vec<AllowedPeer>> {
        match self.execute(node, &ControlCommand::GetAllowed).await? {
            ControlReply::Allowed(peers) => Ok(peers),
            other => Err(unexpected("get_allowed", &other)),
        }
    }
}

fn unexpected(context: &str, reply: &ControlReply) -> Error {
    Error::parse(context, "unexpected reply kind", &format!("{:?}", reply))
}

/// What mirroring an identity into the registry changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdentityUpdate {
    pub changed: bool,
    /// New alias, when it differs from the cached one.
    pub alias_changed: Option<String>,
}

/// Copy a freshly read identity into the node's cached fields. Empty values
/// never overwrite what is cached.
pub fn mirror_identity(registry: &NodeRegistry, node: &str, identity: &Identity) -> Result<IdentityUpdate> {
    let mut changed = registry.set_cached_address(node, &identity.node_address)?;
    changed |= registry.set_cached_eth(node, &identity.eth_address)?;
    let alias_changed = registry.set_cached_alias(node, &identity.alias)?;
    Ok(IdentityUpdate {
        changed: changed || alias_changed,
        alias_changed: alias_changed.then(|| identity.alias.trim().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ScriptedRunner, engine};

    const NODE_INFO: &str = r#"{
        "address": "0xai_AbCdEf",
        "alias": "lab-gpu-01",
        "eth_address": "0xDEADBEEF",
        "version_long": "v2.7.31 | core v7.4.1",
        "version_short": "v2.7.31",
        "info": {"whitelist": ["0xai_peer1", "0xai_peer2"]},
        "is_supervisor": false
    }"#;

    #[test]
    fn node_info_decodes_into_identity() {
        let reply = ControlCommand::GetNodeInfo.parse_reply(NODE_INFO).unwrap();
        let ControlReply::NodeInfo(info) = reply else {
            panic!("wrong reply");
        };
        let identity = Identity::from(&info);
        assert_eq!(identity.node_address, "0xai_AbCdEf");
        assert_eq!(identity.alias, "lab-gpu-01");
        assert_eq!(identity.whitelist.len(), 2);
    }

    #[test]
    fn node_info_missing_required_field_is_parse_error() {
        let err = ControlCommand::GetNodeInfo
            .parse_reply(r#"{"address": "0xai_x", "alias": "a"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.raw_output().unwrap().contains("0xai_x"));
    }

    #[test]
    fn history_accepts_numeric_timestamps_and_drops_null_gpu_series() {
        let stdout = r#"{
            "timestamps": [1714550400, "2024-05-01T08:00:10"],
            "cpu_load": [12.5, 14.0],
            "occupied_memory": [3.1, 3.2],
            "total_memory": [16.0, 16.0],
            "gpu_load": [null, null],
            "gpu_occupied_memory": [null, 2.0],
            "epoch": 181,
            "epoch_avail": 0.97,
            "uptime": "2 days, 4:11:02",
            "version": "v2.7.31"
        }"#;
        let ControlReply::History(history) = ControlCommand::GetNodeHistory.parse_reply(stdout).unwrap() else {
            panic!("wrong reply");
        };
        assert_eq!(history.timestamps, vec!["1714550400", "2024-05-01T08:00:10"]);
        assert!(history.gpu_load.is_none());
        assert_eq!(history.gpu_occupied_memory, Some(vec![None, Some(2.0)]));
        assert_eq!(history.epoch, Some(181));
        assert_eq!(history.uptime.as_deref(), Some("2 days, 4:11:02"));
    }

    #[test]
    fn history_requires_timestamps() {
        let err = ControlCommand::GetNodeHistory
            .parse_reply(r#"{"cpu_load": [1.0]}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn allowed_list_parsing() {
        let text = "0xai_A lab node one\n\n# full line comment\n0xai_B   edge-b # trailing\n0xai_C\n";
        let peers = parse_allowed(text);
        assert_eq!(
            peers,
            vec![
                AllowedPeer { address: "0xai_A".into(), alias: "lab node one".into() },
                AllowedPeer { address: "0xai_B".into(), alias: "edge-b".into() },
                AllowedPeer { address: "0xai_C".into(), alias: String::new() },
            ]
        );
    }

    #[test]
    fn allowed_batch_wire_form() {
        let peers = vec![
            AllowedPeer { address: "0xai_A".into(), alias: "lab one".into() },
            AllowedPeer { address: "0xai_B".into(), alias: "b".into() },
        ];
        let command = ControlCommand::UpdateAllowedBatch(peers);
        assert_eq!(command.stdin().as_deref(), Some("0xai_A lab one\n0xai_B b\n"));
        assert_eq!(command.exec_args("r1node"), vec!["exec", "-i", "r1node", "update_allowed_batch"]);
    }

    #[test]
    fn startup_config_filters_comment_keys() {
        let stdout = r##"{"#comment": "x", "EE_ID": "edge", "NEW_KEY": {"a": 1}}"##;
        let ControlReply::StartupConfig(config) = ControlCommand::GetStartupConfig.parse_reply(stdout).unwrap() else {
            panic!("wrong reply");
        };
        assert!(!config.contains_key("#comment"));
        assert_eq!(config["NEW_KEY"]["a"], 1);
    }

    #[test]
    fn change_alias_passes_alias_as_argument() {
        assert_eq!(
            ControlCommand::ChangeAlias("new name".into()).exec_args("r1node"),
            vec!["exec", "r1node", "change_alias", "new name"]
        );
    }

    #[tokio::test]
    async fn exec_against_missing_container_is_not_found() {
        let runner = ScriptedRunner::new(|_, _| {
            Ok(EngineOutput::failed(1, "Error response from daemon: No such container: r1node"))
        });
        let channel = ControlChannel::new(engine(runner));
        let err = channel.get_node_info("r1node").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "container", .. }));
    }

    #[tokio::test]
    async fn exec_failure_keeps_stderr() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::failed(126, "permission denied")));
        let channel = ControlChannel::new(engine(runner));
        let err = channel.get_allowed("r1node").await.unwrap_err();
        assert!(matches!(err, Error::Engine { code: 126, ref stderr, .. } if stderr == "permission denied"));
    }

    #[tokio::test]
    async fn dispatch_tags_results_with_node() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::ok("0xai_A a\n")));
        let channel = ControlChannel::new(engine(runner));
        let (tx, rx) = tokio::sync::oneshot::channel();
        channel.dispatch(&Handle::current(), "r1node2", ControlCommand::GetAllowed, move |r| {
            let _ = tx.send(r);
        });
        let result = rx.await.unwrap();
        assert_eq!(result.node, "r1node2");
        assert_eq!(result.command, ControlCommand::GetAllowed);
        assert!(matches!(result.result, Ok(ControlReply::Allowed(ref p)) if p.len() == 1));
    }

    #[test]
    fn mirror_identity_reports_alias_change() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::in_dir(dir.path());
        let mut node = LogicalNode::new("r1node", "r1vol");
        node.cached_alias = Some("old".into());
        registry.upsert(node).unwrap();

        let identity = Identity {
            node_address: "0xai_A".into(),
            eth_address: String::new(),
            alias: "new".into(),
            whitelist: BTreeSet::new(),
        };
        let update = mirror_identity(&registry, "r1node", &identity).unwrap();
        assert!(update.changed);
        assert_eq!(update.alias_changed.as_deref(), Some("new"));

        let again = mirror_identity(&registry, "r1node", &identity).unwrap();
        assert_eq!(again, IdentityUpdate::default());
        let stored = registry.get("r1node").unwrap();
        assert_eq!(stored.cached_alias.as_deref(), Some("new"));
        assert_eq!(stored.cached_eth_address, None);
    }
}
