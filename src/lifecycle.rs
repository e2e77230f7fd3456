//! Mapping logical nodes onto engine containers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use futures_util::future::try_join;
use sysinfo::System;
use tracing::{info, warn};

use crate::engine::{Engine, EngineOutput};
use crate::error::{Error, Result};
use crate::pull::{PullEvent, PullTracker};
use crate::registry::LogicalNode;
use crate::updater::{self, UpdateCheck};

pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Where a node's container stands in the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Absent,
    Stopped,
    Running,
}

impl NodeState {
    pub fn label(self) -> &'static str {
        match self {
            NodeState::Absent => "ABSENT",
            NodeState::Stopped => "STOPPED",
            NodeState::Running => "RUNNING",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The node image is built for amd64 only; ARM hosts run it under emulation.
pub fn host_needs_amd64() -> bool {
    let arch = System::cpu_arch().to_ascii_lowercase();
    arch == "arm64" || arch == "aarch64"
}

/// Result of one pull.
#[derive(Debug)]
pub struct PullOutcome {
    pub output: EngineOutput,
    pub tracker: PullTracker,
}

#[derive(Clone)]
pub struct Lifecycle {
    engine: Engine,
    image: String,
    data_path: String,
    force_amd64: bool,
    pull_timeout: Duration,
}

impl Lifecycle {
    pub fn new(engine: Engine, image: impl Into<String>, data_path: impl Into<String>) -> Self {
        Self {
            engine,
            image: image.into(),
            data_path: data_path.into(),
            force_amd64: host_needs_amd64(),
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    pub fn with_amd64_platform(mut self, force: bool) -> Self {
        self.force_amd64 = force;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments of the `run` invocation, in the order the engine expects them.
    pub fn run_args(&self, node: &LogicalNode) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if self.force_amd64 {
            args.push("--platform".to_string());
            args.push("linux/amd64".to_string());
        }
        args.extend([
            "-d".to_string(),
            "--name".to_string(),
            node.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-v".to_string(),
            format!("{}:{}", node.volume_name, self.data_path),
            self.image.clone(),
        ]);
        args
    }

    /// True when the image is already present locally.
    pub async fn ensure_image(&self) -> Result<bool> {
        let output = self
            .engine
            .run(&["images", "-q", self.image.as_str()])
            .await?
            .check("images -q")?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn pull_image(&self, sink: &mut (dyn FnMut(PullEvent) + Send)) -> Result<PullOutcome> {
        info!("Pulling {}", self.image);
        let mut tracker = PullTracker::new();
        let output = {
            let mut on_line = |line: &str| {
                for event in tracker.feed(line) {
                    sink(event);
                }
            };
            self.engine
                .run_lines(&["pull", self.image.as_str()], Some(self.pull_timeout), &mut on_line)
                .await?
        };
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(Error::Pull(if stderr.is_empty() {
                format!("{} exited with {}", self.image, output.exit_code)
            } else {
                stderr.to_string()
            }));
        }
        Ok(PullOutcome { output, tracker })
    }

    pub async fn check_for_image_update(&self, sink: &mut (dyn FnMut(PullEvent) + Send)) -> Result<UpdateCheck> {
        let outcome = self.pull_image(sink).await?;
        Ok(updater::classify(&self.image, &outcome.output, &outcome.tracker))
    }

    /// Pull the image if needed, clear any same-name container and start a
    /// fresh one on the node's volume.
    pub async fn create_and_start(&self, node: &LogicalNode, sink: &mut (dyn FnMut(PullEvent) + Send)) -> Result<()> {
        if !self.ensure_image().await? {
            self.pull_image(sink).await?;
        }
        self.remove(&node.name, true).await?;

        let started = self
            .engine
            .run(self.run_args(node).as_slice())
            .await
            .and_then(|output| output.check("run"));
        match started {
            Ok(_) => {
                info!("Started {} on volume {}", node.name, node.volume_name);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.remove(&node.name, true).await {
                    warn!("Could not clean up {} after failed start: {}", node.name, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Stopping a container that does not exist is not an error.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let output = self.engine.run(&["stop", name]).await?;
        if output.success() || output.reports_missing() {
            return Ok(());
        }
        output.check("stop").map(|_| ())
    }

    /// Removes the container only; the volume is left alone.
    pub async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        let output = self.engine.run(args.as_slice()).await?;
        if output.success() || output.reports_missing() {
            return Ok(());
        }
        output.check("rm").map(|_| ())
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .engine
            .run(&["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        if !output.success() && output.reports_missing() {
            return Ok(false);
        }
        let output = output.check("inspect")?;
        Ok(output.stdout.trim() == "true")
    }

    pub async fn node_state(&self, name: &str) -> Result<NodeState> {
        let output = self
            .engine
            .run(&["container", "inspect", "--format", "{{.State.Running}}", name])
            .await?;
        if !output.success() && output.reports_missing() {
            return Ok(NodeState::Absent);
        }
        let output = output.check("container inspect")?;
        match output.stdout.trim() {
            "true" => Ok(NodeState::Running),
            "false" => Ok(NodeState::Stopped),
            other => Err(Error::parse("container inspect", "expected true or false", other)),
        }
    }

    /// States of many nodes from two listings instead of one inspect each.
    pub async fn states(&self, names: &[String]) -> Result<HashMap<String, NodeState>> {
        let (running, all) = try_join(
            self.engine.run(&["ps", "--format", "{{.Names}}"]),
            self.engine.run(&["ps", "-a", "--format", "{{.Names}}"]),
        )
        .await?;
        let running = name_set(running.check("ps")?);
        let all = name_set(all.check("ps -a")?);
        Ok(names
            .iter()
            .map(|name| {
                let state = if running.contains(name.as_str()) {
                    NodeState::Running
                } else if all.contains(name.as_str()) {
                    NodeState::Stopped
                } else {
                    NodeState::Absent
                };
                (name.clone(), state)
            })
            .collect())
    }

    pub async fn volume_exists(&self, volume: &str) -> Result<bool> {
        let output = self.engine.run(&["volume", "inspect", volume]).await?;
        if output.success() {
            return Ok(true);
        }
        if output.reports_missing() {
            return Ok(false);
        }
        output.check("volume inspect").map(|_| false)
    }
}

fn name_set(output: EngineOutput) -> HashSet<String> {
    output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ScriptedRunner, engine};

    const IMAGE: &str = "ratio1/edge_node:mainnet";
    const DATA: &str = "/edge_node/_local_cache";

    fn lifecycle(runner: std::sync::Arc<ScriptedRunner>) -> Lifecycle {
        Lifecycle::new(engine(runner), IMAGE, DATA).with_amd64_platform(false)
    }

    fn node() -> LogicalNode {
        LogicalNode::new("r1node", "r1vol")
    }

    #[test]
    fn run_arguments_in_order() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::ok("")));
        let args = lifecycle(runner.clone()).run_args(&node());
        assert_eq!(
            args.join(" "),
            "run -d --name r1node --restart unless-stopped -v r1vol:/edge_node/_local_cache ratio1/edge_node:mainnet"
        );
        let args = lifecycle(runner).with_amd64_platform(true).run_args(&node());
        assert_eq!(&args[..3], ["run", "--platform", "linux/amd64"]);
        assert_eq!(args[3], "-d");
    }

    #[tokio::test]
    async fn create_pulls_missing_image_and_force_removes_first() {
        let runner = ScriptedRunner::new(|argv, _| match argv[1].as_str() {
            "images" => Ok(EngineOutput::ok("")),
            "pull" => Ok(EngineOutput::ok("111111111111: Pull complete\n")),
            "rm" => Ok(EngineOutput::failed(1, "Error: No such container: r1node")),
            "run" => Ok(EngineOutput::ok("c0ffee\n")),
            _ => Ok(EngineOutput::failed(1, "unexpected")),
        });
        let mut events = Vec::new();
        lifecycle(runner.clone())
            .create_and_start(&node(), &mut |e| events.push(e))
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], format!("docker images -q {}", IMAGE));
        assert_eq!(calls[1], format!("docker pull {}", IMAGE));
        assert_eq!(calls[2], "docker rm -f r1node");
        assert!(calls[3].starts_with("docker run -d --name r1node"));
        assert!(events.iter().any(|e| matches!(e, PullEvent::Overall { percent, .. } if *percent == 100.0)));
    }

    #[tokio::test]
    async fn failed_run_cleans_up_partial_container() {
        let runner = ScriptedRunner::new(|argv, _| match argv[1].as_str() {
            "images" => Ok(EngineOutput::ok("abc123\n")),
            "rm" => Ok(EngineOutput::ok("")),
            "run" => Ok(EngineOutput::failed(125, "port is already allocated")),
            _ => Ok(EngineOutput::failed(1, "unexpected")),
        });
        let err = lifecycle(runner.clone())
            .create_and_start(&node(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine { code: 125, ref stderr, .. } if stderr == "port is already allocated"));
        let calls = runner.calls();
        assert_eq!(calls.last().map(String::as_str), Some("docker rm -f r1node"));
        assert_eq!(calls.iter().filter(|c| c.starts_with("docker rm")).count(), 2);
    }

    #[tokio::test]
    async fn failed_pull_is_pull_error() {
        let runner = ScriptedRunner::new(|argv, _| match argv[1].as_str() {
            "images" => Ok(EngineOutput::ok("")),
            _ => Ok(EngineOutput::failed(1, "manifest unknown")),
        });
        let err = lifecycle(runner.clone())
            .create_and_start(&node(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pull(ref msg) if msg == "manifest unknown"));
        assert!(!runner.calls().iter().any(|c| c.contains(" run ")));
    }

    #[tokio::test]
    async fn missing_containers_are_benign() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::failed(1, "Error: No such object: r1node")));
        let lc = lifecycle(runner);
        assert!(!lc.is_running("r1node").await.unwrap());
        lc.stop("r1node").await.unwrap();
        lc.remove("r1node", false).await.unwrap();
        assert_eq!(lc.node_state("r1node").await.unwrap(), NodeState::Absent);
    }

    #[tokio::test]
    async fn stop_surfaces_other_failures() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::failed(1, "permission denied")));
        let err = lifecycle(runner).stop("r1node").await.unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
    }

    #[tokio::test]
    async fn states_from_listings() {
        let runner = ScriptedRunner::new(|argv, _| {
            if argv.iter().any(|a| a == "-a") {
                Ok(EngineOutput::ok("r1node\nr1node2\nother\n"))
            } else {
                Ok(EngineOutput::ok("r1node\n"))
            }
        });
        let names = vec!["r1node".to_string(), "r1node2".to_string(), "r1node3".to_string()];
        let states = lifecycle(runner).states(&names).await.unwrap();
        assert_eq!(states["r1node"], NodeState::Running);
        assert_eq!(states["r1node2"], NodeState::Stopped);
        assert_eq!(states["r1node3"], NodeState::Absent);
    }

    #[tokio::test]
    async fn node_state_reads_running_flag() {
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::ok("false\n")));
        let lc = lifecycle(runner.clone());
        assert_eq!(lc.node_state("r1node").await.unwrap(), NodeState::Stopped);
        assert_eq!(
            runner.calls(),
            vec!["docker container inspect --format {{.State.Running}} r1node"]
        );
    }

    #[tokio::test]
    async fn volume_lookup() {
        let runner = ScriptedRunner::new(|argv, _| {
            if argv[3] == "r1vol" {
                Ok(EngineOutput::ok("[{}]"))
            } else {
                Ok(EngineOutput::failed(1, "Error: No such volume: r1vol9"))
            }
        });
        let lc = lifecycle(runner);
        assert!(lc.volume_exists("r1vol").await.unwrap());
        assert!(!lc.volume_exists("r1vol9").await.unwrap());
    }

    #[tokio::test]
    async fn image_check_reports_update() {
        let runner = ScriptedRunner::new(|_, _| {
            Ok(EngineOutput::ok(
                "mainnet: Pulling from ratio1/edge_node\n222222222222: Pull complete\nStatus: Downloaded newer image for ratio1/edge_node:mainnet\n",
            ))
        });
        let check = lifecycle(runner).check_for_image_update(&mut |_| {}).await.unwrap();
        assert!(check.updated);
        assert_eq!(check.image, IMAGE);
    }
}
