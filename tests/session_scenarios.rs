//! End-to-end flows through the coordinator against a scripted engine.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use edgefleet::control::{ControlCommand, ControlReply, ControlResult, NodeHistory};
use edgefleet::engine::EngineOutput;
use edgefleet::lifecycle::NodeState;
use edgefleet::naming;
use edgefleet::registry::{LogicalNode, NodeRegistry};
use edgefleet::session::Event;

#[tokio::test]
async fn first_node_gets_bare_prefix_and_starts() {
    let fake = FakeEngine::new(|line| match line {
        l if l.starts_with("images -q") => EngineOutput::ok("sha256:abc\n"),
        l if l.starts_with("ps") => EngineOutput::ok(""),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    let (mut session, seen) = session(&fake, Arc::clone(&registry));

    session.request_add_node();
    settle(&mut session, |s| s.state("r1node") == Some(NodeState::Running)).await;

    let node = registry.get("r1node").expect("registered");
    assert_eq!(node.volume_name, "r1vol");
    assert_eq!(session.active(), Some("r1node"));
    assert_eq!(seen.lock().added, vec!["r1node".to_string()]);

    let calls = fake.calls();
    let rm = calls.iter().position(|c| c == "docker rm -f r1node").expect("stale container cleared");
    let run = calls
        .iter()
        .position(|c| {
            c == "docker run -d --name r1node --restart unless-stopped -v r1vol:/edge_node/_local_cache ratio1/edge_node:mainnet"
        })
        .expect("run issued");
    assert!(rm < run);

    // survives a reload from disk
    let reloaded = NodeRegistry::in_dir(dir.path());
    assert_eq!(reloaded.names(), vec!["r1node".to_string()]);
}

#[tokio::test]
async fn naming_skips_past_highest_suffix() {
    let fake = FakeEngine::new(|line| {
        if line.starts_with("ps -a") {
            EngineOutput::ok("r1node\nsome_other\n")
        } else {
            EngineOutput::ok("")
        }
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = NodeRegistry::in_dir(dir.path());
    registry.upsert(LogicalNode::new("r1node2", "r1vol2")).unwrap();

    let (name, volume) = naming::allocate(&fake.engine(), &registry, "r1node").await.unwrap();
    assert_eq!(name, "r1node3");
    assert_eq!(volume, "r1vol3");
}

#[tokio::test]
async fn rename_round_trip_updates_cache() {
    let fake = FakeEngine::new(|line| match line {
        "exec r1node change_alias alpha" => EngineOutput::ok("ok\n"),
        "exec r1node get_node_info" => EngineOutput::ok(node_info("0xai_A", "alpha")),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    let mut record = LogicalNode::new("r1node", "r1vol");
    record.cached_alias = Some("old".into());
    registry.upsert(record).unwrap();
    let (mut session, seen) = session(&fake, Arc::clone(&registry));
    session.select(Some("r1node"));

    session.request_rename("r1node", "  alpha ");
    settle(&mut session, |s| !s.is_busy("r1node")).await;

    assert!(fake.calls().contains(&"docker exec r1node change_alias alpha".to_string()));
    assert_eq!(registry.get("r1node").unwrap().cached_alias.as_deref(), Some("alpha"));
    assert_eq!(registry.get("r1node").unwrap().cached_node_address.as_deref(), Some("0xai_A"));
    assert_eq!(seen.lock().aliases, vec![("r1node".to_string(), "alpha".to_string())]);
    assert_eq!(session.identity().map(|i| i.alias.as_str()), Some("alpha"));
    assert!(seen.lock().errors.is_empty());
}

#[tokio::test]
async fn stopped_node_shows_cached_identity_without_exec() {
    let fake = FakeEngine::new(|line| match line {
        "ps -a --format {{.Names}}" => EngineOutput::ok("r1node\n"),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    let mut record = LogicalNode::new("r1node", "r1vol");
    record.cached_alias = Some("sleepy".into());
    record.cached_node_address = Some("0xai_S".into());
    registry.upsert(record).unwrap();
    let (mut session, _seen) = session(&fake, registry);

    session.select(Some("r1node"));
    assert_eq!(session.identity().map(|i| i.alias.as_str()), Some("sleepy"));
    session.tick(Instant::now());
    settle(&mut session, |s| s.state("r1node").is_some()).await;
    session.tick(Instant::now());

    assert_eq!(session.state("r1node"), Some(NodeState::Stopped));
    assert_eq!(session.identity().map(|i| i.node_address.as_str()), Some("0xai_S"));
    assert!(fake.calls().iter().all(|c| !c.starts_with("docker exec")));
    assert!(session.window("r1node").is_none());
}

#[tokio::test]
async fn switching_nodes_drops_late_telemetry() {
    let history = r#"{"timestamps":["2024-05-01 10:00:00","2024-05-01 10:00:10"],
        "cpu_load":[10.0,20.0],"occupied_memory":[1.0,1.5],"total_memory":[8.0,8.0],
        "gpu_load":[null,null],"uptime":"1h 2m","epoch":42}"#;
    let fake = FakeEngine::with_slow("exec r1node ", Duration::from_millis(200), move |line| match line {
        "ps --format {{.Names}}" | "ps -a --format {{.Names}}" => EngineOutput::ok("r1node\nr1node2\n"),
        "exec r1node get_node_info" => EngineOutput::ok(node_info("0xai_A", "alpha")),
        "exec r1node2 get_node_info" => EngineOutput::ok(node_info("0xai_B", "bravo")),
        l if l.ends_with("get_node_history") => EngineOutput::ok(history),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    registry.upsert(LogicalNode::new("r1node", "r1vol")).unwrap();
    registry.upsert(LogicalNode::new("r1node2", "r1vol2")).unwrap();
    let (mut session, _seen) = session(&fake, Arc::clone(&registry));

    session.select(Some("r1node"));
    let running: HashMap<String, NodeState> = [
        ("r1node".to_string(), NodeState::Running),
        ("r1node2".to_string(), NodeState::Running),
    ]
    .into_iter()
    .collect();
    session.handle_event(Event::States(Ok(running)));
    session.select(Some("r1node2"));

    // a reply for the previous selection that slipped through is ignored
    let late: NodeHistory = serde_json::from_str(history).unwrap();
    let changed = session.handle_event(Event::Control(ControlResult {
        node: "r1node".into(),
        command: ControlCommand::GetNodeHistory,
        result: Ok(ControlReply::History(late)),
    }));
    assert!(!changed);

    session.tick(Instant::now());
    settle(&mut session, |s| {
        s.window("r1node2").is_some_and(|w| w.len() == 2) && s.identity().is_some_and(|i| i.alias == "bravo")
    })
    .await;

    assert!(session.window("r1node").is_none());
    assert_eq!(session.uptime(), Some("1h 2m"));
    let latest = session.window("r1node2").and_then(|w| w.latest()).unwrap();
    assert_eq!(latest.cpu_load, 20.0);
    assert_eq!(latest.current_epoch, Some(42));
    assert_eq!(latest.gpu_load, None);
    assert_eq!(registry.get("r1node").unwrap().cached_alias, None);
}

#[tokio::test]
async fn image_update_is_reported_without_restarting() {
    let fake = FakeEngine::new(|line| match line {
        l if l.starts_with("pull") => EngineOutput::ok(
            "mainnet: Pulling from ratio1/edge_node\n\
             4f4fb700ef54: Pulling fs layer\n\
             4f4fb700ef54: Pull complete\n\
             Digest: sha256:0123\n\
             Status: Downloaded newer image for ratio1/edge_node:mainnet\n",
        ),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    registry.upsert(LogicalNode::new("r1node", "r1vol")).unwrap();
    let (mut session, seen) = session(&fake, registry);
    let running: HashMap<String, NodeState> = [("r1node".to_string(), NodeState::Running)].into_iter().collect();
    session.handle_event(Event::States(Ok(running)));

    assert!(session.request_image_check());
    assert!(!session.request_image_check());
    settle(&mut session, |_| !seen.lock().checks.is_empty()).await;

    let (check, candidates) = seen.lock().checks[0].clone();
    assert!(check.updated);
    assert_eq!(check.image, IMAGE);
    assert_eq!(candidates, vec!["r1node".to_string()]);
    let calls = fake.calls();
    assert!(calls.iter().all(|c| !c.contains(" run ") && !c.contains(" stop ") && !c.contains(" rm ")));
    assert_eq!(session.state("r1node"), Some(NodeState::Running));
}

#[tokio::test]
async fn up_to_date_image_has_no_restart_candidates() {
    let fake = FakeEngine::new(|line| match line {
        l if l.starts_with("pull") => EngineOutput::ok(
            "mainnet: Pulling from ratio1/edge_node\n\
             Digest: sha256:0123\n\
             Status: Image is up to date for ratio1/edge_node:mainnet\n",
        ),
        _ => EngineOutput::ok(""),
    });
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(NodeRegistry::in_dir(dir.path()));
    let (mut session, seen) = session(&fake, registry);

    session.request_image_check();
    settle(&mut session, |_| !seen.lock().checks.is_empty()).await;
    let (check, candidates) = seen.lock().checks[0].clone();
    assert!(!check.updated);
    assert!(candidates.is_empty());
}
