use oxprobe_storage::model::{PluginSpec, LOCALHOST_ID, SYSTEM_ACCOUNT};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Scheduler tick period in milliseconds.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_sink_max_retries")]
    pub sink_max_retries: u32,
    #[serde(default = "default_sink_backoff_millis")]
    pub sink_backoff_millis: u64,
    /// Points are only logged when this section is absent.
    #[serde(default)]
    pub influxdb: Option<InfluxDbConfig>,
    #[serde(default)]
    pub hosts: Vec<HostSeed>,
    #[serde(default)]
    pub probes: Vec<ProbeSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            sink_max_retries: default_sink_max_retries(),
            sink_backoff_millis: default_sink_backoff_millis(),
            influxdb: None,
            hosts: Vec::new(),
            probes: Vec::new(),
        }
    }
}

fn default_tick_millis() -> u64 {
    100
}

fn default_sink_max_retries() -> u32 {
    3
}

fn default_sink_backoff_millis() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbConfig {
    pub url: String,
    pub database: String,
}

/// A host created at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSeed {
    /// Fixed id; a snowflake id is generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    pub name: String,
    pub transport: PluginSpec,
}

/// A probe created at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSeed {
    /// Id or name of the host to run on.
    #[serde(default = "default_host")]
    pub host: String,
    pub agent: PluginSpec,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_account_id")]
    pub account_id: String,
}

fn default_account_id() -> String {
    SYSTEM_ACCOUNT.to_string()
}

fn default_host() -> String {
    LOCALHOST_ID.to_string()
}

fn default_interval_secs() -> u64 {
    10
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(text: &str) -> ServerConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        ServerConfig::load(file.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = load_str("");
        assert_eq!(config.tick_millis, 100);
        assert_eq!(config.sink_max_retries, 3);
        assert_eq!(config.sink_backoff(), Duration::from_millis(500));
        assert!(config.influxdb.is_none());
        assert!(config.hosts.is_empty());
        assert!(config.probes.is_empty());
    }

    #[test]
    fn parses_seed_tables() {
        let config = load_str(
            r#"
tick_millis = 250

[influxdb]
url = "http://127.0.0.1:8086"
database = "oxprobe"

[[hosts]]
name = "web-01"
account_id = "acme"
transport = { type = "ssh", params = { host = "10.0.0.5", username = "monitor", port = 2222 } }

[[probes]]
agent = { type = "cpu" }
interval_secs = 5

[[probes]]
host = "web-01"
account_id = "acme"
agent = { type = "nginx", params = { url = "http://127.0.0.1/status" } }
"#,
        );
        assert_eq!(config.tick(), Duration::from_millis(250));
        assert_eq!(config.influxdb.unwrap().database, "oxprobe");

        let host = &config.hosts[0];
        assert_eq!(host.id, None);
        assert_eq!(host.transport.kind, "ssh");
        assert_eq!(host.transport.params["port"], 2222);

        let cpu = &config.probes[0];
        assert_eq!(cpu.host, LOCALHOST_ID);
        assert_eq!(cpu.account_id, SYSTEM_ACCOUNT);
        assert_eq!(cpu.interval_secs, 5);
        assert!(cpu.agent.params.is_null());

        let nginx = &config.probes[1];
        assert_eq!(nginx.interval_secs, 10);
        assert_eq!(nginx.agent.params["url"], "http://127.0.0.1/status");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ServerConfig::load("/nonexistent/oxprobe.toml").is_err());
    }

    #[test]
    fn shipped_sample_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/server.toml");
        let config = ServerConfig::load(path).unwrap();
        assert!(config.influxdb.is_none());
        assert!(config.hosts.is_empty());
        assert_eq!(config.probes.len(), 5);
        assert!(std::fs::read_to_string(path).unwrap().contains("RUST_LOG=oxprobe_storage=debug"));
    }
}
