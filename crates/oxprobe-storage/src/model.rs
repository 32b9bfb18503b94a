use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use oxprobe_collector::{Agent, Registry};
use oxprobe_common::types::Point;
use oxprobe_transport::local::LocalTransport;
use oxprobe_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Id and name of the host that stands for the machine the server runs on.
pub const LOCALHOST_ID: &str = "localhost";

/// Account owning built-in entities such as the localhost host.
pub const SYSTEM_ACCOUNT: &str = "system";

/// An agent instance shared between the store and the task running it.
///
/// The same instance is handed out on every read so that counter state
/// survives from one run of the probe to the next.
pub type SharedAgent = Arc<Mutex<Box<dyn Agent>>>;

/// Discriminated plugin reference as it appears in configuration and
/// serialized records: `{"type": "ssh", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl PluginSpec {
    pub fn new(kind: &str, params: Value) -> Self {
        Self {
            kind: kind.to_string(),
            params,
        }
    }
}

/// A monitored machine and the transport used to reach it.
#[derive(Clone)]
pub struct Host {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub transport: Arc<dyn Transport>,
}

impl Host {
    pub fn new(account_id: &str, name: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            id: oxprobe_common::id::next_id(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            transport: Arc::from(transport),
        }
    }

    /// The machine the server itself runs on, reached without a network hop.
    pub fn localhost() -> Self {
        Self {
            id: LOCALHOST_ID.to_string(),
            account_id: SYSTEM_ACCOUNT.to_string(),
            name: LOCALHOST_ID.to_string(),
            transport: Arc::new(LocalTransport::new()),
        }
    }

    pub fn to_record(&self) -> HostRecord {
        HostRecord {
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            name: self.name.clone(),
            transport: PluginSpec::new(self.transport.name(), self.transport.params()),
        }
    }

    /// Rebuilds a host, resolving its transport through `registry`.
    pub fn from_record(record: HostRecord, registry: &Registry) -> Result<Self> {
        let transport = registry.decode_transport(&record.transport.kind, &record.transport.params)?;
        Ok(Self {
            id: record.id,
            account_id: record.account_id,
            name: record.name,
            transport: Arc::from(transport),
        })
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("name", &self.name)
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Serialized form of a [`Host`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub transport: PluginSpec,
}

/// An agent bound to a host and run at a fixed interval.
#[derive(Clone)]
pub struct Probe {
    pub id: String,
    pub account_id: String,
    pub host_id: String,
    pub agent: SharedAgent,
    pub interval: Duration,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub last_points: Option<Vec<Point>>,
}

impl Probe {
    pub fn new(account_id: &str, host_id: &str, agent: Box<dyn Agent>, interval: Duration) -> Self {
        Self {
            id: oxprobe_common::id::next_id(),
            account_id: account_id.to_string(),
            host_id: host_id.to_string(),
            agent: Arc::new(Mutex::new(agent)),
            interval,
            last_check: None,
            next_check: None,
            last_points: None,
        }
    }

    /// Locks the agent, recovering it if a previous holder panicked.
    pub fn lock_agent(&self) -> MutexGuard<'_, Box<dyn Agent>> {
        self.agent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn agent_name(&self) -> String {
        self.lock_agent().name().to_string()
    }

    pub fn to_record(&self) -> ProbeRecord {
        let (kind, params) = {
            let agent = self.lock_agent();
            (agent.name().to_string(), agent.params())
        };
        ProbeRecord {
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            host_id: self.host_id.clone(),
            agent: PluginSpec { kind, params },
            interval_millis: self.interval.num_milliseconds().max(0) as u64,
            last_check: self.last_check,
            next_check: self.next_check,
            last_points: self.last_points.clone(),
        }
    }

    /// Rebuilds a probe with a fresh agent constructed through `registry`.
    pub fn from_record(record: ProbeRecord, registry: &Registry) -> Result<Self> {
        let agent = registry.decode_agent(&record.agent.kind, &record.agent.params)?;
        Ok(Self {
            id: record.id,
            account_id: record.account_id,
            host_id: record.host_id,
            agent: Arc::new(Mutex::new(agent)),
            interval: Duration::milliseconds(record.interval_millis.min(i64::MAX as u64) as i64),
            last_check: record.last_check,
            next_check: record.next_check,
            last_points: record.last_points,
        })
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("host_id", &self.host_id)
            .field(
                "agent",
                &self
                    .agent
                    .try_lock()
                    .map(|agent| agent.name().to_string())
                    .unwrap_or_else(|_| "<busy>".to_string()),
            )
            .field("interval", &self.interval)
            .field("last_check", &self.last_check)
            .field("next_check", &self.next_check)
            .finish()
    }
}

/// Serialized form of a [`Probe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub id: String,
    pub account_id: String,
    pub host_id: String,
    pub agent: PluginSpec,
    pub interval_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_points: Option<Vec<Point>>,
}
