use crate::error::{RegistryError, Result};
use crate::Agent;
use oxprobe_common::types::Doc;
use oxprobe_transport::local::LocalTransport;
use oxprobe_transport::ssh::{SshPool, SshTransport};
use oxprobe_transport::Transport;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type AgentCtor = Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>;
type TransportCtor = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Maps stable short names to constructors of fresh, unconfigured agents
/// and transports.
///
/// Built once at start-up and then shared read-only behind an `Arc`.
///
/// # Examples
///
/// ```
/// use oxprobe_collector::Registry;
/// use oxprobe_transport::ssh::SshPool;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let registry = Registry::with_defaults(Arc::new(SshPool::new(Duration::from_secs(10))));
/// assert!(registry.has_agent("cpu"));
/// assert!(registry.has_transport("ssh"));
/// assert!(registry.construct_agent("redis").is_err());
/// ```
pub struct Registry {
    agents: BTreeMap<String, AgentCtor>,
    transports: BTreeMap<String, TransportCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            agents: BTreeMap::new(),
            transports: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in agent plus the `local` and `ssh`
    /// transports. SSH transports share `pool`.
    pub fn with_defaults(pool: Arc<SshPool>) -> Self {
        let mut registry = Self::new();
        registry.register_agent("cpu", || Box::new(crate::cpu::CpuAgent::new()));
        registry.register_agent("memory", || Box::new(crate::memory::MemoryAgent::new()));
        registry.register_agent("load", || Box::new(crate::load::LoadAgent::new()));
        registry.register_agent("network", || Box::new(crate::network::NetworkAgent::new()));
        registry.register_agent("disk", || Box::new(crate::disk::DiskAgent::new()));
        registry.register_agent("diskusage", || Box::new(crate::diskusage::DiskUsageAgent::new()));
        registry.register_agent("sockets", || Box::new(crate::sockets::SocketsAgent::new()));
        registry.register_agent("tcpport", || Box::new(crate::tcpport::TcpPortAgent::new()));
        registry.register_agent("ping", || Box::new(crate::ping::PingAgent::new()));
        registry.register_agent("dns", || Box::new(crate::dns::DnsAgent::new()));
        registry.register_agent("nginx", || Box::new(crate::nginx::NginxAgent::new()));
        registry.register_agent("phpfpm", || Box::new(crate::phpfpm::PhpFpmAgent::new()));
        registry.register_agent("mysql", || Box::new(crate::mysql::MysqlAgent::new()));

        registry.register_transport("local", || Box::new(LocalTransport::new()));
        registry.register_transport("ssh", move || Box::new(SshTransport::new(pool.clone())));
        registry
    }

    /// Registers an agent constructor.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register_agent<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    {
        if self.agents.insert(name.to_string(), Box::new(ctor)).is_some() {
            panic!("agent '{name}' registered twice");
        }
    }

    /// Registers a transport constructor.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register_transport<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        if self.transports.insert(name.to_string(), Box::new(ctor)).is_some() {
            panic!("transport '{name}' registered twice");
        }
    }

    pub fn construct_agent(&self, name: &str) -> Result<Box<dyn Agent>> {
        self.agents
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| RegistryError::NotFound {
                kind: "agent",
                name: name.to_string(),
            })
    }

    pub fn construct_transport(&self, name: &str) -> Result<Box<dyn Transport>> {
        self.transports
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| RegistryError::NotFound {
                kind: "transport",
                name: name.to_string(),
            })
    }

    /// Constructs an agent and applies `params` to it.
    pub fn decode_agent(&self, name: &str, params: &Value) -> Result<Box<dyn Agent>> {
        let mut agent = self.construct_agent(name)?;
        agent
            .configure(params)
            .map_err(|e| RegistryError::InvalidParams {
                kind: "agent",
                name: name.to_string(),
                reason: format!("{e:#}"),
            })?;
        Ok(agent)
    }

    /// Constructs a transport and applies `params` to it.
    pub fn decode_transport(&self, name: &str, params: &Value) -> Result<Box<dyn Transport>> {
        let mut transport = self.construct_transport(name)?;
        transport
            .configure(params)
            .map_err(|e| RegistryError::InvalidParams {
                kind: "transport",
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(transport)
    }

    pub fn describe_agent(&self, name: &str) -> Result<Doc> {
        Ok(self.construct_agent(name)?.doc())
    }

    pub fn describe_transport(&self, name: &str) -> Result<Doc> {
        Ok(self.construct_transport(name)?.doc())
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn has_transport(&self, name: &str) -> bool {
        self.transports.contains_key(name)
    }

    /// Registered agent names in lexical order.
    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.keys().map(String::as_str).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use serde_json::json;
    use std::time::Duration;

    fn defaults() -> Registry {
        Registry::with_defaults(Arc::new(SshPool::new(Duration::from_secs(10))))
    }

    #[test]
    fn defaults_register_every_builtin() {
        let registry = defaults();
        assert_eq!(
            registry.agent_names(),
            vec![
                "cpu", "disk", "diskusage", "dns", "load", "memory", "mysql", "network", "nginx",
                "phpfpm", "ping", "sockets", "tcpport"
            ]
        );
        assert_eq!(registry.transport_names(), vec!["local", "ssh"]);
    }

    #[test]
    fn constructed_agents_carry_their_registry_name() {
        let registry = defaults();
        for name in registry.agent_names() {
            assert_eq!(registry.construct_agent(name).unwrap().name(), name);
        }
        for name in registry.transport_names() {
            assert_eq!(registry.construct_transport(name).unwrap().name(), name);
        }
    }

    #[test]
    fn every_agent_is_documented() {
        let registry = defaults();
        for name in registry.agent_names() {
            let doc = registry.describe_agent(name).unwrap();
            assert!(!doc.summary.is_empty(), "{name} has no summary");
            assert!(!doc.metrics.is_empty(), "{name} documents no metrics");
        }
        let ssh = registry.describe_transport("ssh").unwrap();
        assert!(ssh.params.iter().any(|p| p.name == "username"));
    }

    #[test]
    fn unknown_names_are_not_found() {
        let registry = defaults();
        let err = registry.construct_agent("redis").err().unwrap();
        assert_eq!(err.to_string(), "Registry: unknown agent 'redis'");
        assert!(matches!(
            registry.describe_transport("telnet"),
            Err(RegistryError::NotFound { kind: "transport", .. })
        ));
    }

    #[test]
    fn decode_applies_params() {
        let registry = defaults();
        let agent = registry
            .decode_agent("tcpport", &json!({ "address": "10.0.0.1:22" }))
            .unwrap();
        assert_eq!(agent.params(), json!({ "address": "10.0.0.1:22" }));

        let transport = registry
            .decode_transport("ssh", &json!({ "host": "web-01", "username": "monitor" }))
            .unwrap();
        assert_eq!(transport.params()["port"], 22);
    }

    #[test]
    fn decode_rejects_bad_params() {
        let registry = defaults();
        let err = registry
            .decode_agent("cpu", &json!({ "interval": 5 }))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::InvalidParams { kind: "agent", .. }));
        assert!(registry.decode_transport("ssh", &json!({ "host": "x" })).is_err());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_agent_registration_panics() {
        let mut registry = defaults();
        registry.register_agent("cpu", || Box::new(crate::cpu::CpuAgent::new()));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_transport_registration_panics() {
        let mut registry = Registry::new();
        registry.register_transport("fake", || Box::new(FakeTransport::new()));
        registry.register_transport("fake", || Box::new(FakeTransport::new()));
    }

    #[test]
    fn constructors_yield_independent_instances() {
        let registry = defaults();
        let mut first = registry.construct_agent("load").unwrap();
        let second = registry.construct_agent("load").unwrap();
        let transport = FakeTransport::new().with_file("/proc/loadavg", "1 1 1 1/1 1");
        first.gather(&transport).unwrap();
        assert_eq!(first.points().len(), 1);
        assert!(second.points().is_empty());
    }
}
