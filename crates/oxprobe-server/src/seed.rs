use crate::config::{HostSeed, ProbeSeed, ServerConfig};
use anyhow::Context;
use oxprobe_collector::Registry;
use oxprobe_storage::error::StorageError;
use oxprobe_storage::model::HostRecord;
use oxprobe_storage::{Actor, Host, Probe, Scope, Store};

/// Counts of entities created by [`apply`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub hosts: usize,
    pub probes: usize,
}

/// Creates the `[[hosts]]` and `[[probes]]` of `config` in `store`.
///
/// Hosts whose id already exists are skipped. Probes name their host by id
/// or by name, so the localhost host must exist before this runs.
pub fn apply(config: &ServerConfig, store: &dyn Store, registry: &Registry) -> anyhow::Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    for seed in &config.hosts {
        let host = build_host(seed, registry)?;
        let id = host.id.clone();
        match store.add_host(&Actor::System, host) {
            Ok(()) => summary.hosts += 1,
            Err(StorageError::AlreadyExists { .. }) => {
                tracing::debug!(host_id = %id, "Host already exists, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let hosts = store.get_all_hosts(&Actor::System, &Scope::All)?;
    for seed in &config.probes {
        let host = hosts
            .iter()
            .find(|h| h.id == seed.host)
            .or_else(|| hosts.iter().find(|h| h.name == seed.host))
            .with_context(|| format!("probe '{}' refers to unknown host '{}'", seed.agent.kind, seed.host))?;
        let probe = build_probe(seed, &host.id, registry)?;
        store.add_probe(&Actor::System, probe)?;
        summary.probes += 1;
    }

    tracing::info!(hosts = summary.hosts, probes = summary.probes, "Seeded configuration");
    Ok(summary)
}

fn build_host(seed: &HostSeed, registry: &Registry) -> anyhow::Result<Host> {
    let record = HostRecord {
        id: seed.id.clone().unwrap_or_else(oxprobe_common::id::next_id),
        account_id: seed.account_id.clone(),
        name: seed.name.clone(),
        transport: seed.transport.clone(),
    };
    Host::from_record(record, registry).with_context(|| format!("host '{}'", seed.name))
}

fn build_probe(seed: &ProbeSeed, host_id: &str, registry: &Registry) -> anyhow::Result<Probe> {
    if seed.interval_secs == 0 {
        anyhow::bail!("probe '{}' on '{}' has a zero interval", seed.agent.kind, seed.host);
    }
    let agent = registry
        .decode_agent(&seed.agent.kind, &seed.agent.params)
        .with_context(|| format!("probe '{}' on '{}'", seed.agent.kind, seed.host))?;
    let interval = chrono::Duration::seconds(seed.interval_secs.min(i64::MAX as u64) as i64);
    Ok(Probe::new(&seed.account_id, host_id, agent, interval))
}
