use crate::Agent;
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

fn default_address() -> String {
    "127.0.0.1:80".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpPortParams {
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for TcpPortParams {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    up: bool,
    latency_ms: Option<f64>,
    at: DateTime<Utc>,
}

/// Checks that a TCP port accepts connections and measures connect time.
///
/// A refused or timed out connection is a measurement (`up = false`), not a
/// gather failure. A broken SSH session to the host is.
#[derive(Default)]
pub struct TcpPortAgent {
    params: TcpPortParams,
    outcome: Option<Outcome>,
}

impl TcpPortAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for TcpPortAgent {
    fn name(&self) -> &str {
        "tcpport"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.params = match params {
            Value::Null => TcpPortParams::default(),
            other => serde_json::from_value(other.clone())?,
        };
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        self.outcome = None;
        let started = Instant::now();
        let outcome = match transport.dial("tcp", &self.params.address) {
            Ok(mut conn) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                if let Err(e) = conn.close() {
                    tracing::debug!(address = %self.params.address, error = %e, "Closing probe connection failed");
                }
                Outcome {
                    up: true,
                    latency_ms: Some(elapsed),
                    at: Utc::now(),
                }
            }
            // The port cannot be judged when the host itself is unreachable.
            Err(e) if e.is_session_failure() => {
                return Err(anyhow::Error::new(e).context(format!("dialing {}", self.params.address)));
            }
            Err(e) => {
                tracing::debug!(address = %self.params.address, error = %e, "TCP port unreachable");
                Outcome {
                    up: false,
                    latency_ms: None,
                    at: Utc::now(),
                }
            }
        };
        self.outcome = Some(outcome);
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        let Some(outcome) = self.outcome else {
            return Vec::new();
        };
        let mut point = Point::new("tcpport", outcome.at)
            .tag("address", self.params.address.as_str())
            .field("up", outcome.up);
        if let Some(latency) = outcome.latency_ms {
            point = point.field("latency_ms", latency);
        }
        vec![point]
    }

    fn doc(&self) -> Doc {
        Doc::new("TCP connect check through the host's transport.")
            .param(ParamDoc::new("address", "string", "host:port to connect to").with_default("127.0.0.1:80"))
            .metric("tcpport", "up (bool) and latency_ms of the connect; tagged by address")
    }
}
