//! Sequential, collision-free node and volume names.

use std::collections::BTreeSet;

use crate::engine::Engine;
use crate::error::Result;
use crate::registry::NodeRegistry;

pub const DEFAULT_PREFIX: &str = "r1node";

const LEGACY_MARKER: &str = "edge_node_container";

/// Next free name for `prefix` given every name already in use.
///
/// The bare prefix is used if free; otherwise the highest numeric suffix plus
/// one (the bare prefix counts as suffix 1), so gaps are never refilled.
pub fn next_name<'a, I>(prefix: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut bare_taken = false;
    let mut highest: u64 = 1;
    for name in existing {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            bare_taken = true;
        } else if rest.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(k) = rest.parse::<u64>() {
                highest = highest.max(k);
            }
        }
    }
    if !bare_taken {
        return prefix.to_string();
    }
    format!("{}{}", prefix, highest.saturating_add(1))
}

/// Volume backing a node; a fixed function of the node name.
pub fn volume_for(name: &str) -> String {
    if name.contains(LEGACY_MARKER) {
        return name.replace("container", "volume");
    }
    if let Some(rest) = name.strip_prefix("r1node") {
        if rest.bytes().all(|b| b.is_ascii_digit()) {
            return format!("r1vol{}", rest);
        }
    }
    format!("volume_{}", name)
}

/// Names of all containers the engine knows about, running or not.
pub async fn engine_container_names(engine: &Engine) -> Result<Vec<String>> {
    let output = engine
        .run(&["ps", "-a", "--format", "{{.Names}}"])
        .await?
        .check("ps -a")?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Next free `(node_name, volume_name)` consulting both the engine and the registry.
pub async fn allocate(engine: &Engine, registry: &NodeRegistry, prefix: &str) -> Result<(String, String)> {
    let mut taken: BTreeSet<String> = engine_container_names(engine).await?.into_iter().collect();
    taken.extend(registry.names());
    let name = next_name(prefix, taken.iter().map(String::as_str));
    let volume = volume_for(&name);
    Ok((name, volume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::engine::testing::{ScriptedRunner, engine};
    use crate::registry::LogicalNode;

    #[test]
    fn bare_prefix_when_free() {
        assert_eq!(next_name("r1node", std::iter::empty()), "r1node");
        assert_eq!(next_name("r1node", ["other", "r1node7"]), "r1node");
    }

    #[test]
    fn highest_suffix_plus_one() {
        assert_eq!(next_name("r1node", ["r1node", "r1node2"]), "r1node3");
        assert_eq!(next_name("r1node", ["r1node"]), "r1node2");
        assert_eq!(next_name("r1node", ["r1node", "r1node9", "r1node4"]), "r1node10");
    }

    #[test]
    fn ignores_non_numeric_suffixes() {
        assert_eq!(next_name("r1node", ["r1node", "r1node-old", "r1nodex2"]), "r1node2");
    }

    #[test]
    fn never_collides() {
        let sets: [&[&str]; 5] = [
            &["r1node"],
            &["r1node", "r1node1"],
            &["r1node", "r1node2", "r1node3"],
            &["r1node", "r1node007"],
            &["r1node", "r1node99999999999999999999999"],
        ];
        for existing in sets {
            let name = next_name("r1node", existing.iter().copied());
            assert!(!existing.contains(&name.as_str()), "{} collides", name);
            assert_eq!(name, next_name("r1node", existing.iter().copied()));
        }
    }

    #[test]
    fn volume_names() {
        assert_eq!(volume_for("r1node"), "r1vol");
        assert_eq!(volume_for("r1node12"), "r1vol12");
        assert_eq!(volume_for("edge_node_container_2"), "edge_node_volume_2");
        assert_eq!(volume_for("lab"), "volume_lab");
        assert_eq!(volume_for("r1node-x"), "volume_r1node-x");
        assert_eq!(volume_for("lab"), volume_for("lab"));
    }

    #[tokio::test]
    async fn allocate_consults_engine_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::in_dir(dir.path());
        registry.upsert(LogicalNode::new("r1node4", "r1vol4")).unwrap();
        let runner = ScriptedRunner::new(|_, _| Ok(EngineOutput::ok("r1node\nr1node2\nportainer\n")));

        let (name, volume) = allocate(&engine(runner.clone()), &registry, DEFAULT_PREFIX)
            .await
            .unwrap();
        assert_eq!((name.as_str(), volume.as_str()), ("r1node5", "r1vol5"));
        assert_eq!(runner.calls(), vec!["docker ps -a --format {{.Names}}"]);
    }
}
