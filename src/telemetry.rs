//! Bounded per-node telemetry windows and the poll cadence that feeds them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::control::NodeHistory;

/// One point of a node's history, flattened from the index-aligned series.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: String,
    pub cpu_load: f64,
    pub occupied_memory: f64,
    pub total_memory: Option<f64>,
    pub gpu_load: Option<f64>,
    pub gpu_occupied_memory: Option<f64>,
    pub uptime: Option<String>,
    pub current_epoch: Option<u64>,
    pub current_epoch_avail: Option<f64>,
    pub version: Option<String>,
}

fn at(series: &Option<Vec<Option<f64>>>, idx: usize) -> Option<f64> {
    series.as_ref().and_then(|s| s.get(idx).copied().flatten())
}

/// Split a history reply into samples. Node-level scalars (uptime, epoch,
/// version) describe the moment of the reply and are attached to the newest
/// sample only.
pub fn samples_from_history(history: &NodeHistory) -> Vec<TelemetrySample> {
    let last = history.timestamps.len().saturating_sub(1);
    history
        .timestamps
        .iter()
        .enumerate()
        .map(|(idx, timestamp)| {
            let newest = idx == last;
            TelemetrySample {
                timestamp: timestamp.clone(),
                cpu_load: at(&history.cpu_load, idx).unwrap_or(0.0),
                occupied_memory: at(&history.occupied_memory, idx).unwrap_or(0.0),
                total_memory: at(&history.total_memory, idx),
                gpu_load: at(&history.gpu_load, idx),
                gpu_occupied_memory: at(&history.gpu_occupied_memory, idx),
                uptime: history.uptime.clone().filter(|_| newest),
                current_epoch: history.epoch.filter(|_| newest),
                current_epoch_avail: history.epoch_avail.filter(|_| newest),
                version: history.version.clone().filter(|_| newest),
            }
        })
        .collect()
}

/// The last `capacity` samples of one node, oldest first.
#[derive(Debug, Clone)]
pub struct TelemetryWindow {
    capacity: usize,
    samples: VecDeque<TelemetrySample>,
    last_batch: Vec<String>,
}

impl TelemetryWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity),
            last_batch: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.samples.back()
    }

    /// Append one sample unless it repeats the newest timestamp.
    pub fn push(&mut self, sample: TelemetrySample) -> bool {
        if self.latest().is_some_and(|l| l.timestamp == sample.timestamp) {
            return false;
        }
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        true
    }

    /// Merge a full history reply: only samples newer than what is held are
    /// appended, and a reply identical to the previous one is a no-op.
    /// Returns the number of samples appended.
    pub fn merge(&mut self, incoming: Vec<TelemetrySample>) -> usize {
        let batch: Vec<String> = incoming.iter().map(|s| s.timestamp.clone()).collect();
        if batch == self.last_batch {
            return 0;
        }
        self.last_batch = batch;

        let start = match self.latest() {
            Some(latest) => incoming
                .iter()
                .rposition(|s| s.timestamp == latest.timestamp)
                .map_or(0, |idx| idx + 1),
            None => 0,
        };
        incoming
            .into_iter()
            .skip(start)
            .map(|sample| self.push(sample))
            .filter(|appended| *appended)
            .count()
    }
}

/// What a tick should start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueWork {
    pub poll: bool,
    pub image_check: bool,
    pub update_check: bool,
}

impl DueWork {
    pub fn any(&self) -> bool {
        self.poll || self.image_check || self.update_check
    }
}

/// Cooperative timers for polling, image checks and launcher update reminders.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    poll_interval: Duration,
    image_check_interval: Duration,
    update_check_interval: Duration,
    last_poll: Option<Instant>,
    last_image_check: Option<Instant>,
    last_update_check: Option<Instant>,
}

impl PollSchedule {
    /// Polling starts immediately; the first image and update checks wait a
    /// full interval from `start`.
    pub fn new(config: &SessionConfig, start: Instant) -> Self {
        Self {
            poll_interval: config.poll_interval,
            image_check_interval: config.image_check_interval,
            update_check_interval: config.update_check_interval,
            last_poll: None,
            last_image_check: Some(start),
            last_update_check: Some(start),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Report due work and mark it as started at `now`.
    pub fn due(&mut self, now: Instant) -> DueWork {
        DueWork {
            poll: fire(&mut self.last_poll, self.poll_interval, now),
            image_check: fire(&mut self.last_image_check, self.image_check_interval, now),
            update_check: fire(&mut self.last_update_check, self.update_check_interval, now),
        }
    }

    /// Make the next `due` poll regardless of the interval.
    pub fn poll_now(&mut self) {
        self.last_poll = None;
    }

    pub fn image_check_now(&mut self) {
        self.last_image_check = None;
    }

    /// Time until the nearest timer fires.
    pub fn until_next(&self, now: Instant) -> Duration {
        [
            (self.last_poll, self.poll_interval),
            (self.last_image_check, self.image_check_interval),
            (self.last_update_check, self.update_check_interval),
        ]
        .into_iter()
        .map(|(last, interval)| match last {
            Some(last) => (last + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        })
        .min()
        .unwrap_or(self.poll_interval)
    }
}

fn fire(last: &mut Option<Instant>, interval: Duration, now: Instant) -> bool {
    let due = match *last {
        Some(at) => now.saturating_duration_since(at) >= interval,
        None => true,
    };
    if due {
        *last = Some(now);
    }
    due
}
