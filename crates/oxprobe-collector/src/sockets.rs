use crate::{lenient, read_text, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, Point};
use oxprobe_transport::Transport;
use std::collections::HashMap;

const PROC_SOCKSTAT: &str = "/proc/net/sockstat";

/// (section, key, field) triples read from /proc/net/sockstat.
const SOCKSTAT_KEYS: [(&str, &str, &str); 9] = [
    ("sockets", "used", "used"),
    ("TCP", "inuse", "tcp_inuse"),
    ("TCP", "orphan", "tcp_orphan"),
    ("TCP", "tw", "tcp_time_wait"),
    ("TCP", "alloc", "tcp_alloc"),
    ("TCP", "mem", "tcp_mem"),
    ("UDP", "inuse", "udp_inuse"),
    ("UDP", "mem", "udp_mem"),
    ("RAW", "inuse", "raw_inuse"),
];

fn parse_sockstat(text: &str) -> HashMap<&'static str, f64> {
    let mut values: HashMap<&'static str, f64> =
        SOCKSTAT_KEYS.iter().map(|(_, _, field)| (*field, 0.0)).collect();
    for line in text.lines() {
        let Some((section, rest)) = line.split_once(':') else {
            continue;
        };
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        for pair in tokens.chunks(2) {
            let key = pair[0];
            let found = SOCKSTAT_KEYS
                .iter()
                .find(|(s, k, _)| *s == section.trim() && *k == key);
            if let Some((_, _, field)) = found {
                values.insert(*field, lenient(pair.get(1).copied()));
            }
        }
    }
    values
}

#[derive(Default)]
pub struct SocketsAgent {
    values: HashMap<&'static str, f64>,
    captured_at: Option<DateTime<Utc>>,
}

impl SocketsAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for SocketsAgent {
    fn name(&self) -> &str {
        "sockets"
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let text = read_text(transport, PROC_SOCKSTAT)?;
        self.values = parse_sockstat(&text);
        self.captured_at = Some(Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        match self.captured_at {
            Some(at) => vec![Point::new("sockets", at)
                .fields(self.values.iter().map(|(k, v)| (k.to_string(), *v)))],
            None => Vec::new(),
        }
    }

    fn doc(&self) -> Doc {
        Doc::new("Socket usage by protocol, from /proc/net/sockstat.")
            .metric("sockets", "used, tcp_inuse, tcp_orphan, tcp_time_wait, tcp_alloc, udp_inuse...")
    }
}
