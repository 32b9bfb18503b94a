use crate::{lenient, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn default_count() -> u32 {
    3
}

fn default_timeout() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingParams {
    pub target: String,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Per-reply timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u32,
}

impl Default for PingParams {
    fn default() -> Self {
        Self {
            target: "127.0.0.1".to_string(),
            count: default_count(),
            timeout: default_timeout(),
        }
    }
}

/// Parses the summary lines printed by `ping -q` (iputils and busybox).
pub(crate) fn parse_ping(output: &str) -> HashMap<&'static str, f64> {
    let mut values = HashMap::new();
    for line in output.lines() {
        if line.contains("packets transmitted") {
            for part in line.split(',') {
                let number = part.split_whitespace().next();
                let key = if part.contains("transmitted") {
                    "transmitted"
                } else if part.contains("received") {
                    "received"
                } else if part.contains("packet loss") {
                    "loss_percent"
                } else {
                    continue;
                };
                values.insert(key, lenient(number.map(|n| n.trim_end_matches('%'))));
            }
        } else if let Some((labels, numbers)) = line.split_once('=') {
            if !labels.contains("min/avg/max") {
                continue;
            }
            let mut parts = numbers.trim().trim_end_matches("ms").trim().split('/');
            values.insert("rtt_min_ms", lenient(parts.next()));
            values.insert("rtt_avg_ms", lenient(parts.next()));
            values.insert("rtt_max_ms", lenient(parts.next()));
        }
    }
    values
}

/// ICMP reachability of a target, measured with the host's `ping` binary.
#[derive(Default)]
pub struct PingAgent {
    params: PingParams,
    values: HashMap<&'static str, f64>,
    captured_at: Option<DateTime<Utc>>,
}

impl PingAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for PingAgent {
    fn name(&self) -> &str {
        "ping"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.params = serde_json::from_value(params.clone())?;
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let count = self.params.count.max(1).to_string();
        let timeout = self.params.timeout.max(1).to_string();
        let args = ["-c", count.as_str(), "-W", timeout.as_str(), "-q", self.params.target.as_str()];

        self.values = match transport.exec("ping", &args) {
            Ok(output) => parse_ping(&output.stdout_string()?),
            // ping exits 1 when no reply came back at all.
            Err(TransportError::ExitStatus { code: 1, .. }) => HashMap::from([
                ("transmitted", f64::from(self.params.count.max(1))),
                ("received", 0.0),
                ("loss_percent", 100.0),
            ]),
            Err(e) => return Err(e.into()),
        };
        self.captured_at = Some(Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        match self.captured_at {
            Some(at) => vec![Point::new("ping", at)
                .tag("target", self.params.target.as_str())
                .fields(self.values.iter().map(|(k, v)| (k.to_string(), *v)))],
            None => Vec::new(),
        }
    }

    fn doc(&self) -> Doc {
        Doc::new("ICMP echo round trips using the ping command on the host.")
            .param(ParamDoc::new("target", "string", "Host name or address to ping"))
            .param(ParamDoc::new("count", "integer", "Echo requests per gather").with_default("3"))
            .param(ParamDoc::new("timeout", "integer", "Seconds to wait for each reply").with_default("2"))
            .metric("ping", "transmitted, received, loss_percent, rtt_min_ms, rtt_avg_ms, rtt_max_ms; tagged by target")
    }
}
