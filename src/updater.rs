//! Classification of periodic image pulls.
//!
//! A pull that fetched nothing is a quiet, informational result. A pull that
//! brought in new layers is surfaced to the user together with the running
//! nodes that would pick the new image up on their next start. Nodes are never
//! restarted from here.

use std::collections::HashMap;

use crate::engine::EngineOutput;
use crate::lifecycle::NodeState;
use crate::pull::PullTracker;

const UP_TO_DATE: &str = "image is up to date";
const NEWER_IMAGE: &str = "downloaded newer image";

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateCheck {
    pub image: String,
    pub updated: bool,
    /// Last status line of the pull, for the status bar.
    pub summary: String,
}

pub fn classify(image: &str, output: &EngineOutput, tracker: &PullTracker) -> UpdateCheck {
    let stdout = output.stdout.to_ascii_lowercase();
    let stderr = output.stderr.to_ascii_lowercase();
    let up_to_date = stdout.contains(UP_TO_DATE) || stderr.contains(UP_TO_DATE);
    let updated = !up_to_date && (tracker.fetched_layers() || stdout.contains(NEWER_IMAGE));
    let summary = output
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(if updated { "Image updated" } else { "Image is up to date" })
        .to_string();
    UpdateCheck {
        image: image.to_string(),
        updated,
        summary,
    }
}

/// Running nodes that are still on the previous image after an update.
pub fn restart_candidates(check: &UpdateCheck, states: &HashMap<String, NodeState>) -> Vec<String> {
    if !check.updated {
        return Vec::new();
    }
    let mut names: Vec<String> = states
        .iter()
        .filter(|(_, state)| **state == NodeState::Running)
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = "ratio1/edge_node:mainnet";

    fn tracked(stdout: &str) -> PullTracker {
        let mut tracker = PullTracker::new();
        for line in stdout.lines() {
            tracker.feed(line);
        }
        tracker
    }

    #[test]
    fn up_to_date_is_quiet() {
        let stdout = "mainnet: Pulling from ratio1/edge_node\nDigest: sha256:abc\nStatus: Image is up to date for ratio1/edge_node:mainnet\n";
        let check = classify(IMAGE, &EngineOutput::ok(stdout), &tracked(stdout));
        assert!(!check.updated);
        assert_eq!(check.summary, "Status: Image is up to date for ratio1/edge_node:mainnet");
    }

    #[test]
    fn fetched_layers_mean_update() {
        let stdout = "mainnet: Pulling from ratio1/edge_node\n\
                      111111111111: Already exists\n\
                      222222222222: Pulling fs layer\n\
                      222222222222: Download complete\n\
                      222222222222: Pull complete\n\
                      Digest: sha256:def\n\
                      Status: Downloaded newer image for ratio1/edge_node:mainnet\n";
        let check = classify(IMAGE, &EngineOutput::ok(stdout), &tracked(stdout));
        assert!(check.updated);
    }

    #[test]
    fn phrase_on_stderr_wins() {
        let stdout = "222222222222: Pull complete\n";
        let mut output = EngineOutput::ok(stdout);
        output.stderr = "Image is up to date".into();
        assert!(!classify(IMAGE, &output, &tracked(stdout)).updated);
    }

    #[test]
    fn candidates_only_after_update() {
        let states = HashMap::from([
            ("r1node2".to_string(), NodeState::Running),
            ("r1node".to_string(), NodeState::Running),
            ("r1node3".to_string(), NodeState::Stopped),
        ]);
        let mut check = UpdateCheck {
            image: IMAGE.into(),
            updated: false,
            summary: String::new(),
        };
        assert!(restart_candidates(&check, &states).is_empty());
        check.updated = true;
        assert_eq!(restart_candidates(&check, &states), vec!["r1node", "r1node2"]);
    }
}
