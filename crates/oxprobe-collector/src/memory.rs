use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use std::collections::HashMap;

const PROC_MEMINFO: &str = "/proc/meminfo";

/// /proc/meminfo keys and the field each one feeds. Values are in kB.
const MEMINFO_KEYS: [(&str, &str); 9] = [
    ("MemTotal", "total"),
    ("MemFree", "free"),
    ("MemAvailable", "available"),
    ("Buffers", "buffers"),
    ("Cached", "cached"),
    ("Shmem", "shared"),
    ("Dirty", "dirty"),
    ("SwapTotal", "swap_total"),
    ("SwapFree", "swap_free"),
];

pub struct MemoryAgent {
    values: HashMap<&'static str, f64>,
    captured_at: Option<DateTime<Utc>>,
}

impl MemoryAgent {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            captured_at: None,
        }
    }
}

impl Default for MemoryAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_meminfo(text: &str) -> HashMap<&'static str, f64> {
    let mut values: HashMap<&'static str, f64> =
        MEMINFO_KEYS.iter().map(|(_, field)| (*field, 0.0)).collect();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some((_, field)) = MEMINFO_KEYS.iter().find(|(k, _)| *k == key.trim()) {
            values.insert(*field, lenient(rest.split_whitespace().next()) * 1024.0);
        }
    }
    values
}

impl Agent for MemoryAgent {
    fn name(&self) -> &str {
        "memory"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_MEMINFO)?;
        self.values = parse_meminfo(&text);
        self.captured_at = Some(Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some(at) = self.captured_at else {
            return Vec::new();
        };
        let get = |k: &str| self.values.get(k).copied().unwrap_or(0.0);
        let total = get("total");
        let used = (total - get("free") - get("buffers") - get("cached")).max(0.0);
        let used_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        let swap_used = (get("swap_total") - get("swap_free")).max(0.0);

        let point = Point::new("memory", at)
            .fields(self.values.iter().map(|(k, v)| (k.to_string(), *v)))
            .field("used", used)
            .field("used_percent", used_percent)
            .field("swap_used", swap_used);
        vec![point]
    }

    fn doc(&self) -> Doc {
        Doc::new("Memory and swap usage in bytes, from /proc/meminfo.")
            .metric("memory", "total, free, available, buffers, cached, used, used_percent, swap_*")
    }
}
