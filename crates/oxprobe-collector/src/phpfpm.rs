use crate::delta::{Counters, DeltaTracker, Kind, COUNT_PRECISION};
use crate::http::{self, Url};
use crate::{lenient, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_url() -> String {
    "http://127.0.0.1/status".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhpFpmParams {
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for PhpFpmParams {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

/// Status page keys: (key, field, kind).
const STATUS_KEYS: [(&str, &str, Kind); 11] = [
    ("accepted conn", "accepted_conn", Kind::Counter),
    ("slow requests", "slow_requests", Kind::Counter),
    ("max children reached", "max_children_reached", Kind::Counter),
    ("listen queue", "listen_queue", Kind::Gauge),
    ("max listen queue", "max_listen_queue", Kind::Gauge),
    ("listen queue len", "listen_queue_len", Kind::Gauge),
    ("idle processes", "idle_processes", Kind::Gauge),
    ("active processes", "active_processes", Kind::Gauge),
    ("total processes", "total_processes", Kind::Gauge),
    ("max active processes", "max_active_processes", Kind::Gauge),
    ("start since", "uptime", Kind::Gauge),
];

#[derive(Debug, Default)]
pub(crate) struct PoolStatus {
    pub pool: Option<String>,
    pub counters: Counters,
    pub gauges: Counters,
}

pub(crate) fn parse_status(body: &str) -> PoolStatus {
    let mut status = PoolStatus::default();
    for (_, field, kind) in STATUS_KEYS {
        match kind {
            Kind::Counter => status.counters.insert(field.to_string(), 0.0),
            Kind::Gauge => status.gauges.insert(field.to_string(), 0.0),
        };
    }
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key == "pool" {
            status.pool = Some(value.trim().to_string());
            continue;
        }
        if let Some((_, field, kind)) = STATUS_KEYS.iter().find(|(k, _, _)| *k == key) {
            let value = lenient(Some(value));
            match kind {
                Kind::Counter => status.counters.insert(field.to_string(), value),
                Kind::Gauge => status.gauges.insert(field.to_string(), value),
            };
        }
    }
    status
}

/// PHP-FPM pool statistics from the pool's status page.
pub struct PhpFpmAgent {
    params: PhpFpmParams,
    tracker: DeltaTracker,
    pool: Option<String>,
    gauges: Counters,
    rates: Counters,
    captured_at: Option<DateTime<Utc>>,
}

impl PhpFpmAgent {
    pub fn new() -> Self {
        Self {
            params: PhpFpmParams::default(),
            tracker: DeltaTracker::new(COUNT_PRECISION),
            pool: None,
            gauges: Counters::new(),
            rates: Counters::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, body: &str, at: DateTime<Utc>) {
        let status = parse_status(body);
        self.rates = self.tracker.update_one(status.counters, at).unwrap_or_default();
        self.gauges = status.gauges;
        self.pool = status.pool;
        self.captured_at = Some(at);
    }
}

impl Default for PhpFpmAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for PhpFpmAgent {
    fn name(&self) -> &str {
        "phpfpm"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let params: PhpFpmParams = match params {
            Value::Null => PhpFpmParams::default(),
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
        let Some(at) = self.captured_at else {
            return Vec::new();
        };
        let mut point = Point::new("phpfpm", at)
            .fields(self.gauges.iter().map(|(k, v)| (k.clone(), *v)))
            .fields(self.rates.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(pool) = &self.pool {
            point = point.tag("pool", pool.as_str());
        }
        vec![point]
    }

    fn doc(&self) -> Doc {
        Doc::new("PHP-FPM pool statistics from the pm.status_path page.")
            .param(ParamDoc::new("url", "string", "URL of the FPM status page").with_default("http://127.0.0.1/status"))
            .metric("phpfpm", "process and listen queue gauges; accepted_conn, slow_requests per second; tagged by pool")
    }
}
