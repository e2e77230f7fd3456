//! Process-wide preferences persisted beside the registry.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::Result;
use crate::registry::write_json_atomic;

pub const SETTINGS_FILE: &str = "settings.json";

/// Network the edge nodes join; selects the image tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Mainnet,
    Testnet,
    Devnet,
}

impl Environment {
    pub fn image_tag(self) -> &'static str {
        match self {
            Environment::Mainnet => "mainnet",
            Environment::Testnet => "testnet",
            Environment::Devnet => "devnet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Some(Environment::Mainnet),
            "testnet" => Some(Environment::Testnet),
            "devnet" => Some(Environment::Devnet),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.image_tag())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub force_debug: bool,
    #[serde(default)]
    pub active_environment: Environment,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<Settings>,
}

impl SettingsStore {
    /// Load settings; a missing or unreadable file means defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Settings::default(),
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                let backup = path.with_extension("json.corrupt");
                warn!(
                    "Settings {} are unreadable ({}); moving them to {}",
                    path.display(),
                    e,
                    backup.display()
                );
                if let Err(e) = std::fs::rename(&path, &backup) {
                    warn!("Could not move unreadable settings aside: {}", e);
                }
                Settings::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => {
                warn!("Could not read settings {}: {}", path.display(), e);
                Settings::default()
            }
        };
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::open(dir.join(SETTINGS_FILE))
    }

    pub fn get(&self) -> Settings {
        self.current.lock().clone()
    }

    pub fn force_debug(&self) -> bool {
        self.current.lock().force_debug
    }

    pub fn environment(&self) -> Environment {
        self.current.lock().active_environment
    }

    pub fn set_force_debug(&self, enabled: bool) -> Result<()> {
        self.modify(|s| s.force_debug = enabled)
    }

    pub fn set_environment(&self, env: Environment) -> Result<()> {
        self.modify(|s| s.active_environment = env)
    }

    fn modify<F: FnOnce(&mut Settings)>(&self, f: F) -> Result<()> {
        let mut current = self.current.lock();
        let mut next = current.clone();
        f(&mut next);
        write_json_atomic(&self.path, &next)?;
        *current = next;
        Ok(())
    }
}
