use crate::delta::{Counters, DeltaTracker, Kind, COUNT_PRECISION};
use crate::{lenient, Agent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oxprobe_common::types::{Doc, ParamDoc, Point};
use oxprobe_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MysqlParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Option file holding credentials; preferred over `password`, which is
    /// visible in the remote process list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl MysqlParams {
    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        // mysqladmin only honours this option in first position.
        if let Some(file) = &self.defaults_file {
            args.push(format!("--defaults-extra-file={file}"));
        }
        if let Some(host) = &self.host {
            args.push(format!("--host={host}"));
        }
        if let Some(port) = self.port {
            args.push(format!("--port={port}"));
        }
        if let Some(user) = &self.user {
            args.push(format!("--user={user}"));
        }
        if let Some(password) = &self.password {
            args.push(format!("--password={password}"));
        }
        args.push("extended-status".to_string());
        args
    }
}

/// Global status variables: (variable, field, kind).
const STATUS_VARIABLES: [(&str, &str, Kind); 20] = [
    ("Questions", "questions", Kind::Counter),
    ("Queries", "queries", Kind::Counter),
    ("Com_select", "com_select", Kind::Counter),
    ("Com_insert", "com_insert", Kind::Counter),
    ("Com_update", "com_update", Kind::Counter),
    ("Com_delete", "com_delete", Kind::Counter),
    ("Slow_queries", "slow_queries", Kind::Counter),
    ("Connections", "connections", Kind::Counter),
    ("Aborted_clients", "aborted_clients", Kind::Counter),
    ("Aborted_connects", "aborted_connects", Kind::Counter),
    ("Bytes_received", "bytes_received", Kind::Counter),
    ("Bytes_sent", "bytes_sent", Kind::Counter),
    ("Created_tmp_disk_tables", "created_tmp_disk_tables", Kind::Counter),
    ("Innodb_rows_read", "innodb_rows_read", Kind::Counter),
    ("Innodb_rows_inserted", "innodb_rows_inserted", Kind::Counter),
    ("Threads_connected", "threads_connected", Kind::Gauge),
    ("Threads_running", "threads_running", Kind::Gauge),
    ("Open_tables", "open_tables", Kind::Gauge),
    ("Max_used_connections", "max_used_connections", Kind::Gauge),
    ("Uptime", "uptime", Kind::Gauge),
];

#[derive(Debug, Default)]
pub(crate) struct GlobalStatus {
    pub counters: Counters,
    pub gauges: Counters,
}

/// Parses the ASCII table printed by `mysqladmin extended-status`. Tab
/// separated `Variable_name\tValue` rows (as printed by `mysql -B`) are
/// accepted as well.
pub(crate) fn parse_extended_status(output: &str) -> GlobalStatus {
    let mut status = GlobalStatus::default();
    for line in output.lines() {
        let cells: Vec<&str> = if line.contains('|') {
            line.split('|').map(str::trim).filter(|c| !c.is_empty()).collect()
        } else {
            line.split('\t').map(str::trim).collect()
        };
        let &[name, value] = cells.as_slice() else { continue };
        if let Some((_, field, kind)) = STATUS_VARIABLES.iter().find(|(v, _, _)| *v == name) {
            let value = lenient(Some(value));
            match kind {
                Kind::Counter => status.counters.insert(field.to_string(), value),
                Kind::Gauge => status.gauges.insert(field.to_string(), value),
            };
        }
    }
    status
}

/// MySQL/MariaDB server activity, read with `mysqladmin extended-status`
/// on the monitored host.
pub struct MysqlAgent {
    params: MysqlParams,
    tracker: DeltaTracker,
    gauges: Counters,
    rates: Counters,
    captured_at: Option<DateTime<Utc>>,
}

impl MysqlAgent {
    pub fn new() -> Self {
        Self {
            params: MysqlParams::default(),
            tracker: DeltaTracker::new(COUNT_PRECISION),
            gauges: Counters::new(),
            rates: Counters::new(),
            captured_at: None,
        }
    }

    fn ingest(&mut self, output: &str, at: DateTime<Utc>) -> Result<()> {
        let status = parse_extended_status(output);
        if status.counters.is_empty() && status.gauges.is_empty() {
            anyhow::bail!("mysqladmin printed no known status variables");
        }
        self.rates = self.tracker.update_one(status.counters, at).unwrap_or_default();
        self.gauges = status.gauges;
        self.captured_at = Some(at);
        Ok(())
    }
}

impl Default for MysqlAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for MysqlAgent {
    fn name(&self) -> &str {
        "mysql"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.params = match params {
            Value::Null => MysqlParams::default(),
            other => serde_json::from_value(other.clone())?,
        };
        Ok(())
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn gather(&mut self, transport: &dyn Transport) -> Result<()> {
        let args = self.params.args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = transport.exec("mysqladmin", &args)?.stdout_string()?;
        self.ingest(&output, Utc::now())
    }

    fn points(&self) -> Vec<Point> {
        match self.captured_at {
            Some(at) => vec![Point::new("mysql", at)
                .fields(self.gauges.iter().map(|(k, v)| (k.clone(), *v)))
                .fields(self.rates.iter().map(|(k, v)| (k.clone(), *v)))],
            None => Vec::new(),
        }
    }

    fn doc(&self) -> Doc {
        Doc::new("MySQL global status through mysqladmin on the monitored host.")
            .param(ParamDoc::new("host", "string", "Server host, mysqladmin default when unset"))
            .param(ParamDoc::new("port", "integer", "Server port"))
            .param(ParamDoc::new("user", "string", "Login user"))
            .param(ParamDoc::new("defaults_file", "string", "Option file with credentials"))
            .param(ParamDoc::new("password", "string", "Login password"))
            .metric("mysql", "query, connection and byte counters per second; thread and table gauges")
    }
}
