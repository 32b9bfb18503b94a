use crate::delta::{Counters, DeltaTracker, COUNT_PRECISION};
use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use std::collections::HashMap;

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Column order after the `iface:` prefix of /proc/net/dev.
const DEV_COLUMNS: [&str; 16] = [
    "bytes_recv",
    "packets_recv",
    "errin",
    "dropin",
    "fifoin",
    "framein",
    "compressedin",
    "multicastin",
    "bytes_sent",
    "packets_sent",
    "errout",
    "dropout",
    "fifoout",
    "colls",
    "carrier",
    "compressedout",
];

pub(crate) fn parse_net_dev(text: &str) -> HashMap<String, Counters> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(iface, _)| !iface.contains('|'))
        .map(|(iface, rest)| {
            let mut tokens = rest.split_whitespace();
            let counters = DEV_COLUMNS
                .iter()
                .map(|col| (col.to_string(), lenient(tokens.next())))
                .collect();
            (iface.trim().to_string(), counters)
        })
        .collect()
}

/// Per-interface traffic rates.
pub struct NetworkAgent {
    tracker: DeltaTracker,
    rates: HashMap<String, Counters>,
    captured_at: Option<DateTime<Utc>>,
}

impl NetworkAgent {
    pub fn new() -> Self {
        Self {
            tracker: DeltaTracker::new(COUNT_PRECISION),
            rates: HashMap::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, text: &str, at: DateTime<Utc>) {
        self.rates = self.tracker.update(parse_net_dev(text), at);
        self.captured_at = Some(at);
    }
}

impl Default for NetworkAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for NetworkAgent {
    fn name(&self) -> &str {
        "network"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_NET_DEV)?;
        self.ingest(&text, Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some(at) = self.captured_at else {
            return Vec::new();
        };
        let mut ifaces: Vec<_> = self.rates.iter().collect();
        ifaces.sort_by(|a, b| a.0.cmp(b.0));
        ifaces
            .into_iter()
            .map(|(iface, rates)| {
                Point::new("network.interface", at)
                    .tag("interface", iface.as_str())
                    .fields(rates.iter().map(|(k, v)| (k.clone(), *v)))
            })
            .collect()
    }

    fn doc(&self) -> Doc {
        Doc::new("Network interface counters as per-second rates, from /proc/net/dev.")
            .metric("network.interface", "bytes/packets sent and received, errors, drops; tagged by interface")
    }
}
