//! Runtime configuration assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{Engine, LOCAL_TIMEOUT, REMOTE_TIMEOUT};
use crate::naming::DEFAULT_PREFIX;
use crate::registry::REGISTRY_FILE;
use crate::settings::{Environment, SETTINGS_FILE};

pub const DEFAULT_IMAGE_REPOSITORY: &str = "ratio1/edge_node";
pub const DEFAULT_DATA_PATH: &str = "/edge_node/_local_cache";
pub const APP_DIR: &str = "edgefleet";

/// Per-user directory holding the registry, settings and logs.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    /// Engine executable, looked up on PATH (or on the remote host).
    pub engine_program: String,
    /// Opaque words placed before every engine invocation, e.g. `ssh edge-01`.
    pub command_prefix: Vec<String>,
    pub image_repository: String,
    /// Overrides the tag derived from the active environment.
    pub image_tag: Option<String>,
    /// Mount point of the node volume inside the container.
    pub data_path: String,
    /// Overrides the local/remote default engine deadline.
    pub engine_timeout: Option<Duration>,
    pub pull_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            engine_program: "docker".to_string(),
            command_prefix: Vec::new(),
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            image_tag: None,
            data_path: DEFAULT_DATA_PATH.to_string(),
            engine_timeout: None,
            pull_timeout: Duration::from_secs(30 * 60),
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.config_dir.join(REGISTRY_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// `<repository>:<tag>`, the tag following the environment unless overridden.
    pub fn image_ref(&self, env: Environment) -> String {
        let tag = self.image_tag.as_deref().unwrap_or(env.image_tag());
        format!("{}:{}", self.image_repository, tag)
    }

    /// Split a `--remote` string such as `ssh -p 2222 edge-01` into prefix words.
    pub fn parse_prefix(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(str::to_string).collect()
    }

    pub fn effective_engine_timeout(&self) -> Duration {
        self.engine_timeout.unwrap_or(if self.command_prefix.is_empty() {
            LOCAL_TIMEOUT
        } else {
            REMOTE_TIMEOUT
        })
    }

    /// Engine driven by real child processes.
    pub fn engine(&self) -> Engine {
        Engine::new(
            std::sync::Arc::new(crate::engine::ProcessRunner),
            self.engine_program.clone(),
            self.command_prefix.clone(),
        )
        .with_timeout(self.effective_engine_timeout())
    }
}

/// Cadences of the cooperative poller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub node_prefix: String,
    pub poll_interval: Duration,
    pub image_check_interval: Duration,
    pub update_check_interval: Duration,
    pub window_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node_prefix: DEFAULT_PREFIX.to_string(),
            poll_interval: Duration::from_secs(10),
            image_check_interval: Duration::from_secs(300),
            update_check_interval: Duration::from_secs(3600),
            window_size: 30,
        }
    }
}
