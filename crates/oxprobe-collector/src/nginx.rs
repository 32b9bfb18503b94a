use crate::delta::{Counters, DeltaTracker, COUNT_PRECISION};
use crate::http::{self, Url};
use crate::{lenient, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_url() -> String {
    "http://127.0.0.1/nginx_status".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NginxParams {
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for NginxParams {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct StubStatus {
    pub gauges: Counters,
    pub counters: Counters,
}

/// Parses the `ngx_http_stub_status_module` page.
pub(crate) fn parse_stub_status(body: &str) -> StubStatus {
    let mut status = StubStatus::default();
    for field in ["active", "reading", "writing", "waiting"] {
        status.gauges.insert(field.to_string(), 0.0);
    }
    let mut lines = body.lines();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if let Some(active) = line.strip_prefix("Active connections:") {
            status.gauges.insert("active".to_string(), lenient(Some(active)));
        } else if line.starts_with("server accepts") {
            let mut numbers = lines.next().unwrap_or_default().split_whitespace();
            for field in ["accepts", "handled", "requests"] {
                status.counters.insert(field.to_string(), lenient(numbers.next()));
            }
        } else if line.starts_with("Reading:") {
            // Reading: 6 Writing: 179 Waiting: 106
            let tokens: Vec<&str> = line.split_whitespace().collect();
            for pair in tokens.chunks(2) {
                let key = pair[0].trim_end_matches(':').to_lowercase();
                if status.gauges.contains_key(&key) {
                    status.gauges.insert(key, lenient(pair.get(1).copied()));
                }
            }
        }
    }
    status
}

/// nginx connection gauges and request rates from the stub_status page.
pub struct NginxAgent {
    params: NginxParams,
    tracker: DeltaTracker,
    gauges: Counters,
    rates: Counters,
    captured_at: Option<DateTime<Utc>>,
}

impl NginxAgent {
    pub fn new() -> Self {
        Self {
            params: NginxParams::default(),
            tracker: DeltaTracker::new(COUNT_PRECISION),
            gauges: Counters::new(),
            rates: Counters::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, body: &str, at: DateTime<Utc>) {
        let status = parse_stub_status(body);
        self.rates = self.tracker.update_one(status.counters, at).unwrap_or_default();
        self.gauges = status.gauges;
        self.captured_at = Some(at);
    }
}

impl Default for NginxAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for NginxAgent {
    fn name(&self) -> &str {
        "nginx"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let params: NginxParams = match params {
            Value::Null => NginxParams::default(),
            other => serde_json::from_value(other.clone())?,
        };
        Url::parse(&params.url)?;
        self.params = params;
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let url = Url::parse(&self.params.url)?;
        let body = http::get_ok(transport, &url)?;
        self.ingest(&body, Utc::now());
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        match self.captured_at {
            Some(at) => vec![Point::new("nginx", at)
                .fields(self.gauges.iter().map(|(k, v)| (k.clone(), *v)))
                .fields(self.rates.iter().map(|(k, v)| (k.clone(), *v)))],
            None => Vec::new(),
        }
    }

    fn doc(&self) -> Doc {
        Doc::new("nginx activity from the stub_status module.")
            .param(ParamDoc::new("url", "string", "URL of the stub_status page").with_default("http://127.0.0.1/nginx_status"))
            .metric("nginx", "active, reading, writing, waiting connections; accepts, handled, requests per second")
    }
}
