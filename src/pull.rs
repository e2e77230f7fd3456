//! Line-oriented parsing of `pull` progress output.

use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum LayerStatus {
    Waiting,
    PullingFsLayer,
    Downloading,
    VerifyingChecksum,
    DownloadComplete,
    Extracting,
    PullComplete,
    AlreadyExists,
    Other(String),
}

impl LayerStatus {
    fn parse(text: &str) -> Self {
        const PHRASES: [(&str, LayerStatus); 8] = [
            ("Waiting", LayerStatus::Waiting),
            ("Pulling fs layer", LayerStatus::PullingFsLayer),
            ("Downloading", LayerStatus::Downloading),
            ("Verifying Checksum", LayerStatus::VerifyingChecksum),
            ("Download complete", LayerStatus::DownloadComplete),
            ("Extracting", LayerStatus::Extracting),
            ("Pull complete", LayerStatus::PullComplete),
            ("Already exists", LayerStatus::AlreadyExists),
        ];
        PHRASES
            .iter()
            .find(|(phrase, _)| text.starts_with(phrase))
            .map(|(_, status)| status.clone())
            .unwrap_or_else(|| LayerStatus::Other(text.to_string()))
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            LayerStatus::DownloadComplete | LayerStatus::PullComplete | LayerStatus::AlreadyExists
        )
    }
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LayerStatus::Waiting => "Waiting",
            LayerStatus::PullingFsLayer => "Pulling fs layer",
            LayerStatus::Downloading => "Downloading",
            LayerStatus::VerifyingChecksum => "Verifying Checksum",
            LayerStatus::DownloadComplete => "Download complete",
            LayerStatus::Extracting => "Extracting",
            LayerStatus::PullComplete => "Pull complete",
            LayerStatus::AlreadyExists => "Already exists",
            LayerStatus::Other(s) => s,
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerProgress {
    pub id: String,
    pub status: LayerStatus,
    pub percent: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PullEvent {
    /// `<tag>: Pulling from <repository>`
    Started { reference: String },
    Layer(LayerProgress),
    Overall { percent: f64, layers: usize },
    /// `Digest: …`, `Status: …` and other free-form lines.
    Status(String),
}

/// Accumulates per-layer state across the lines of one pull.
#[derive(Debug, Default)]
pub struct PullTracker {
    layers: Vec<LayerProgress>,
}

impl PullTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers(&self) -> &[LayerProgress] {
        &self.layers
    }

    /// Mean of per-layer percents; 0 before any layer has been seen.
    pub fn overall_percent(&self) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        self.layers.iter().map(|l| l.percent).sum::<f64>() / self.layers.len() as f64
    }

    /// True once any layer had to be fetched rather than reused.
    pub fn fetched_layers(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.status != LayerStatus::AlreadyExists)
    }

    pub fn feed(&mut self, line: &str) -> Vec<PullEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if line.contains("Pulling from") {
            return vec![PullEvent::Started {
                reference: line.to_string(),
            }];
        }
        let Some((id, rest)) = split_layer(line) else {
            return vec![PullEvent::Status(line.to_string())];
        };

        let status = LayerStatus::parse(rest);
        let reported = if status.is_complete() {
            Some(100.0)
        } else {
            progress_percent(rest)
        };

        let idx = match self.layers.iter().position(|l| l.id == id) {
            Some(idx) => idx,
            None => {
                self.layers.push(LayerProgress {
                    id: id.to_string(),
                    status: LayerStatus::Waiting,
                    percent: 0.0,
                });
                self.layers.len() - 1
            }
        };
        let layer = &mut self.layers[idx];
        layer.status = status;
        if let Some(p) = reported {
            // Extraction restarts its own counter; never let a layer go backwards.
            layer.percent = layer.percent.max(p.clamp(0.0, 100.0));
        }
        let layer = layer.clone();

        vec![
            PullEvent::Layer(layer),
            PullEvent::Overall {
                percent: self.overall_percent(),
                layers: self.layers.len(),
            },
        ]
    }
}

/// `<12-hex-id>: rest` or `sha256:<hex>: rest`.
fn split_layer(line: &str) -> Option<(&str, &str)> {
    let (id, rest) = if let Some(digest) = line.strip_prefix("sha256:") {
        let end = digest.find(':')?;
        let hex = &digest[..end];
        if hex.len() < 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        (&line[.."sha256:".len() + end], &digest[end + 1..])
    } else {
        let (id, rest) = line.split_once(':')?;
        if id.len() != 12 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        (id, rest)
    };
    Some((id, rest.trim()))
}

/// Percent from an `NN%` token or an `X.YMB/Z.WMB` ratio.
fn progress_percent(text: &str) -> Option<f64> {
    for token in text.split_whitespace() {
        if let Some(number) = token.strip_suffix('%') {
            if let Ok(p) = number.parse::<f64>() {
                return Some(p);
            }
        }
    }
    for token in text.split_whitespace() {
        if let Some((done, total)) = token.split_once('/') {
            if let (Some(done), Some(total)) = (parse_size(done), parse_size(total)) {
                if total > 0.0 {
                    return Some(done / total * 100.0);
                }
            }
        }
    }
    None
}

/// `12.3MB` → bytes.
fn parse_size(token: &str) -> Option<f64> {
    let split = token.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = token.split_at(split);
    let value: f64 = number.parse().ok()?;
    let scale = match unit.to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => return None,
    };
    Some(value * scale)
}
