use crate::delta::{Counters, DeltaTracker, Kind, COUNT_PRECISION};
use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use std::collections::HashMap;

const PROC_DISKSTATS: &str = "/proc/diskstats";
const SECTOR_SIZE: f64 = 512.0;

/// Columns of /proc/diskstats after `major minor name`, with the field
/// each one feeds and the multiplier applied to the raw value.
const DISK_COLUMNS: [(&str, Kind, f64); 11] = [
    ("reads", Kind::Counter, 1.0),
    ("read_merged", Kind::Counter, 1.0),
    ("read_bytes", Kind::Counter, SECTOR_SIZE),
    ("read_time", Kind::Counter, 1.0),
    ("writes", Kind::Counter, 1.0),
    ("write_merged", Kind::Counter, 1.0),
    ("write_bytes", Kind::Counter, SECTOR_SIZE),
    ("write_time", Kind::Counter, 1.0),
    ("in_progress", Kind::Gauge, 1.0),
    ("io_time", Kind::Counter, 1.0),
    ("weighted_io_time", Kind::Counter, 1.0),
];

const IGNORED_PREFIXES: [&str; 2] = ["loop", "ram"];

#[derive(Debug, Default)]
pub(crate) struct DiskSample {
    pub counters: HashMap<String, Counters>,
    pub gauges: HashMap<String, Counters>,
}

pub(crate) fn parse_diskstats(text: &str) -> DiskSample {
    let mut sample = DiskSample::default();
    for line in text.lines() {
        let mut tokens = line.split_whitespace().skip(2);
        let Some(device) = tokens.next() else { continue };
        if IGNORED_PREFIXES.iter().any(|p| device.starts_with(p)) {
            continue;
        }
        let mut counters = Counters::new();
        let mut gauges = Counters::new();
        for (field, kind, scale) in DISK_COLUMNS {
            let value = lenient(tokens.next()) * scale;
            match kind {
                Kind::Counter => counters.insert(field.to_string(), value),
                Kind::Gauge => gauges.insert(field.to_string(), value),
            };
        }
        sample.counters.insert(device.to_string(), counters);
        sample.gauges.insert(device.to_string(), gauges);
    }
    sample
}

/// Block device I/O rates per device.
pub struct DiskAgent {
    tracker: DeltaTracker,
    rates: HashMap<String, Counters>,
    gauges: HashMap<String, Counters>,
    captured_at: Option<DateTime<Utc>>,
}

impl DiskAgent {
    pub fn new() -> Self {
        Self {
            tracker: DeltaTracker::new(COUNT_PRECISION),
            rates: HashMap::new(),
            gauges: HashMap::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, text: &str, at: DateTime<Utc>) {
        let sample = parse_diskstats(text);
        self.rates = self.tracker.update(sample.counters, at);
        self.gauges = sample.gauges;
        self.captured_at = Some(at);
    }
}

impl Default for DiskAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for DiskAgent {
    fn name(&self) -> &str {
        "disk"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_DISKSTATS)?;
        self.ingest(&text, Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some(at) = self.captured_at else {
            return Vec::new();
        };
        let mut devices: Vec<_> = self.rates.iter().collect();
        devices.sort_by(|a, b| a.0.cmp(b.0));
        devices
            .into_iter()
            .map(|(device, rates)| {
                let gauges = self.gauges.get(device).into_iter().flatten();
                Point::new("disk.io", at)
                    .tag("device", device.as_str())
                    .fields(rates.iter().map(|(k, v)| (k.clone(), *v)))
                    .fields(gauges.map(|(k, v)| (k.clone(), *v)))
            })
            .collect()
    }

    fn doc(&self) -> Doc {
        Doc::new("Block device activity as per-second rates, from /proc/diskstats.")
            .metric("disk.io", "reads, writes, bytes, time spent; in_progress gauge; tagged by device")
    }
}
