//! Persistent registry of logical nodes.
//!
//! One JSON document (a list of records) under the per-user config directory.
//! Records keep keys this version does not know about so that files written by
//! newer launchers survive a round trip through older ones.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const REGISTRY_FILE: &str = "containers.json";

/// The console's durable view of one edge node, independent of whether a
/// container currently exists for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalNode {
    pub name: String,
    #[serde(rename = "volume")]
    pub volume_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "last_used")]
    pub last_used_at: DateTime<Utc>,
    #[serde(rename = "node_address", default, skip_serializing_if = "Option::is_none")]
    pub cached_node_address: Option<String>,
    #[serde(rename = "eth_address", default, skip_serializing_if = "Option::is_none")]
    pub cached_eth_address: Option<String>,
    #[serde(rename = "node_alias", default, skip_serializing_if = "Option::is_none")]
    pub cached_alias: Option<String>,
    /// Keys written by other launcher versions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogicalNode {
    pub fn new(name: impl Into<String>, volume_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            volume_name: volume_name.into(),
            created_at: now,
            last_used_at: now,
            cached_node_address: None,
            cached_eth_address: None,
            cached_alias: None,
            extra: Map::new(),
        }
    }

    /// Alias if known, otherwise the container name.
    pub fn display_name(&self) -> &str {
        self.cached_alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.name)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn keep_non_empty(slot: &mut Option<String>, incoming: Option<String>) {
    if let Some(v) = non_empty(incoming) {
        *slot = Some(v);
    }
}

/// Thread-safe store of [`LogicalNode`] records backed by one file.
pub struct NodeRegistry {
    path: PathBuf,
    nodes: Mutex<Vec<LogicalNode>>,
}

impl NodeRegistry {
    /// Load the registry at `path`. Read failures degrade to an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let nodes = load_nodes(&path);
        debug!("Loaded {} nodes from {}", nodes.len(), path.display());
        Self {
            path,
            nodes: Mutex::new(nodes),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::open(dir.join(REGISTRY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<LogicalNode> {
        self.nodes.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.lock().iter().map(|n| n.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<LogicalNode> {
        self.nodes.lock().iter().find(|n| n.name == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Add or update a record. Empty cached fields in `node` never clear
    /// stored ones, and a volume may back only one node.
    pub fn upsert(&self, node: LogicalNode) -> Result<()> {
        if node.name.trim().is_empty() {
            return Err(Error::Registry("node name must not be empty".to_string()));
        }
        let mut nodes = self.nodes.lock();
        if let Some(owner) = nodes
            .iter()
            .find(|n| n.volume_name == node.volume_name && n.name != node.name)
        {
            return Err(Error::AlreadyExists {
                kind: "volume",
                name: format!("{} (owned by {})", node.volume_name, owner.name),
            });
        }

        let mut next = nodes.clone();
        match next.iter_mut().find(|n| n.name == node.name) {
            Some(stored) => {
                stored.volume_name = node.volume_name;
                stored.created_at = stored.created_at.min(node.created_at);
                stored.last_used_at = node.last_used_at;
                keep_non_empty(&mut stored.cached_node_address, node.cached_node_address);
                keep_non_empty(&mut stored.cached_eth_address, node.cached_eth_address);
                keep_non_empty(&mut stored.cached_alias, node.cached_alias);
                stored.extra.extend(node.extra);
            }
            None => {
                info!("Registering node {} (volume {})", node.name, node.volume_name);
                next.push(LogicalNode {
                    cached_node_address: non_empty(node.cached_node_address),
                    cached_eth_address: non_empty(node.cached_eth_address),
                    cached_alias: non_empty(node.cached_alias),
                    ..node
                });
            }
        }
        write_json_atomic(&self.path, &next)?;
        *nodes = next;
        Ok(())
    }

    /// Drop the record. The node's volume is left to the engine.
    pub fn remove(&self, name: &str) -> Result<Option<LogicalNode>> {
        let mut nodes = self.nodes.lock();
        let Some(idx) = nodes.iter().position(|n| n.name == name) else {
            return Ok(None);
        };
        let mut next = nodes.clone();
        let removed = next.remove(idx);
        write_json_atomic(&self.path, &next)?;
        *nodes = next;
        info!("Removed node {} from registry", name);
        Ok(Some(removed))
    }

    pub fn set_cached_address(&self, name: &str, address: &str) -> Result<bool> {
        self.set_cached(name, address, |n| &mut n.cached_node_address)
    }

    pub fn set_cached_eth(&self, name: &str, address: &str) -> Result<bool> {
        self.set_cached(name, address, |n| &mut n.cached_eth_address)
    }

    pub fn set_cached_alias(&self, name: &str, alias: &str) -> Result<bool> {
        self.set_cached(name, alias, |n| &mut n.cached_alias)
    }

    pub fn touch_last_used(&self, name: &str) -> Result<()> {
        self.update(name, |n| {
            n.last_used_at = Utc::now();
            true
        })
        .map(|_| ())
    }

    /// Returns whether the stored value changed. Empty values are ignored.
    fn set_cached<F>(&self, name: &str, value: &str, field: F) -> Result<bool>
    where
        F: Fn(&mut LogicalNode) -> &mut Option<String>,
    {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }
        self.update(name, |n| {
            let slot = field(n);
            if slot.as_deref() == Some(value) {
                false
            } else {
                *slot = Some(value.to_string());
                true
            }
        })
    }

    fn update<F>(&self, name: &str, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut LogicalNode) -> bool,
    {
        let mut nodes = self.nodes.lock();
        let mut next = nodes.clone();
        let node = next
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NotFound {
                kind: "node",
                name: name.to_string(),
            })?;
        if !mutate(node) {
            return Ok(false);
        }
        write_json_atomic(&self.path, &next)?;
        *nodes = next;
        Ok(true)
    }
}

fn load_nodes(path: &Path) -> Vec<LogicalNode> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Could not read registry {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    if text.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str(&text) {
        Ok(nodes) => nodes,
        Err(e) => {
            // Keep the unreadable file around instead of overwriting it on the next save.
            let backup = path.with_extension("json.corrupt");
            warn!(
                "Registry {} is unreadable ({}); moving it to {}",
                path.display(),
                e,
                backup.display()
            );
            if let Err(e) = std::fs::rename(path, &backup) {
                warn!("Could not move unreadable registry aside: {}", e);
            }
            Vec::new()
        }
    }
}

/// Serialize `value` next to `path` and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
