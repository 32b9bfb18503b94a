use crate::broadcast::{
    Broadcaster, NoopBroadcaster, HOST_ADDED, HOST_DELETED, HOST_UPDATED, PROBE_ADDED,
    PROBE_DELETED, PROBE_UPDATED,
};
use crate::error::{Result, StorageError};
use crate::model::{Host, Probe};
use crate::store::{Actor, Scope, Store};
use chrono::{DateTime, Utc};
use oxprobe_common::types::Point;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-local [`Store`] backed by two maps.
///
/// Probe reads return clones that share the stored agent instance, so an
/// agent keeps its counter history for as long as the probe exists.
pub struct MemoryStore {
    hosts: RwLock<HashMap<String, Host>>,
    probes: RwLock<HashMap<String, Probe>>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_broadcaster(Arc::new(NoopBroadcaster))
    }

    pub fn with_broadcaster(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
            broadcaster,
        }
    }

    fn hosts(&self) -> RwLockReadGuard<'_, HashMap<String, Host>> {
        self.hosts.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hosts_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Host>> {
        self.hosts.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn probes(&self) -> RwLockReadGuard<'_, HashMap<String, Probe>> {
        self.probes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn probes_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Probe>> {
        self.probes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies `change` to the stored probe under the write lock.
    fn modify_probe<F: FnOnce(&mut Probe)>(&self, actor: &Actor, id: &str, change: F) -> Result<()> {
        let updated = {
            let mut probes = self.probes_mut();
            let existing = probes.get_mut(id).ok_or_else(|| not_found("probe", id))?;
            check_access(actor, "probe", id, &existing.account_id)?;
            change(existing);
            existing.clone()
        };
        self.emit_probe(PROBE_UPDATED, &updated);
        Ok(())
    }

    fn emit_probe(&self, event: &str, probe: &Probe) {
        match serde_json::to_value(probe.to_record()) {
            Ok(payload) => self.broadcaster.broadcast(event, payload),
            Err(e) => tracing::warn!(probe_id = %probe.id, error = %e, "Failed to encode probe event"),
        }
    }

    fn emit_host(&self, event: &str, host: &Host) {
        match serde_json::to_value(host.to_record()) {
            Ok(payload) => self.broadcaster.broadcast(event, payload),
            Err(e) => tracing::warn!(host_id = %host.id, error = %e, "Failed to encode host event"),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_access(actor: &Actor, entity: &'static str, id: &str, account_id: &str) -> Result<()> {
    if actor.can_access(account_id) {
        Ok(())
    } else {
        Err(StorageError::AccessDenied {
            entity,
            id: id.to_string(),
        })
    }
}

fn not_found(entity: &'static str, id: &str) -> StorageError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
}

impl Store for MemoryStore {
    fn get_all_probes(&self, actor: &Actor, scope: &Scope) -> Result<Vec<Probe>> {
        let mut probes: Vec<Probe> = self
            .probes()
            .values()
            .filter(|p| actor.can_access(&p.account_id))
            .filter(|p| match scope {
                Scope::All => true,
                Scope::Account(account) => &p.account_id == account,
                Scope::Host(host) => &p.host_id == host,
            })
            .cloned()
            .collect();
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(probes)
    }

    fn get_probe(&self, actor: &Actor, id: &str) -> Result<Probe> {
        let probe = self.probes().get(id).cloned().ok_or_else(|| not_found("probe", id))?;
        check_access(actor, "probe", id, &probe.account_id)?;
        Ok(probe)
    }

    fn add_probe(&self, actor: &Actor, probe: Probe) -> Result<()> {
        check_access(actor, "probe", &probe.id, &probe.account_id)?;
        // Surfaces NotFound / AccessDenied for the bound host.
        self.get_host(actor, &probe.host_id)?;
        {
            let mut probes = self.probes_mut();
            if probes.contains_key(&probe.id) {
                return Err(StorageError::AlreadyExists {
                    entity: "probe",
                    id: probe.id,
                });
            }
            probes.insert(probe.id.clone(), probe.clone());
        }
        self.emit_probe(PROBE_ADDED, &probe);
        Ok(())
    }

    fn update_probe(&self, actor: &Actor, probe: &Probe) -> Result<()> {
        check_access(actor, "probe", &probe.id, &probe.account_id)?;
        {
            let mut probes = self.probes_mut();
            let existing = probes.get_mut(&probe.id).ok_or_else(|| not_found("probe", &probe.id))?;
            check_access(actor, "probe", &probe.id, &existing.account_id)?;
            *existing = probe.clone();
        }
        self.emit_probe(PROBE_UPDATED, probe);
        Ok(())
    }

    fn delete_probe(&self, actor: &Actor, id: &str) -> Result<()> {
        {
            let mut probes = self.probes_mut();
            let existing = probes.get(id).ok_or_else(|| not_found("probe", id))?;
            check_access(actor, "probe", id, &existing.account_id)?;
            probes.remove(id);
        }
        self.broadcaster.broadcast(PROBE_DELETED, json!({ "id": id }));
        Ok(())
    }

    fn record_run(
        &self,
        actor: &Actor,
        id: &str,
        checked_at: DateTime<Utc>,
        points: Option<Vec<Point>>,
    ) -> Result<()> {
        self.modify_probe(actor, id, |probe| {
            probe.last_check = Some(checked_at);
            probe.next_check = Some(checked_at + probe.interval);
            probe.last_points = points;
        })
    }

    fn reschedule(&self, actor: &Actor, id: &str, next_check: DateTime<Utc>) -> Result<()> {
        self.modify_probe(actor, id, |probe| probe.next_check = Some(next_check))
    }

    fn get_host(&self, actor: &Actor, id: &str) -> Result<Host> {
        let host = self.hosts().get(id).cloned().ok_or_else(|| not_found("host", id))?;
        check_access(actor, "host", id, &host.account_id)?;
        Ok(host)
    }

    fn get_all_hosts(&self, actor: &Actor, scope: &Scope) -> Result<Vec<Host>> {
        let mut hosts: Vec<Host> = self
            .hosts()
            .values()
            .filter(|h| actor.can_access(&h.account_id))
            .filter(|h| match scope {
                Scope::All => true,
                Scope::Account(account) => &h.account_id == account,
                Scope::Host(id) => &h.id == id,
            })
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    fn add_host(&self, actor: &Actor, host: Host) -> Result<()> {
        check_access(actor, "host", &host.id, &host.account_id)?;
        {
            let mut hosts = self.hosts_mut();
            if hosts.contains_key(&host.id) {
                return Err(StorageError::AlreadyExists {
                    entity: "host",
                    id: host.id,
                });
            }
            hosts.insert(host.id.clone(), host.clone());
        }
        self.emit_host(HOST_ADDED, &host);
        Ok(())
    }

    fn update_host(&self, actor: &Actor, host: &Host) -> Result<()> {
        check_access(actor, "host", &host.id, &host.account_id)?;
        {
            let mut hosts = self.hosts_mut();
            let existing = hosts.get_mut(&host.id).ok_or_else(|| not_found("host", &host.id))?;
            check_access(actor, "host", &host.id, &existing.account_id)?;
            *existing = host.clone();
        }
        self.emit_host(HOST_UPDATED, host);
        Ok(())
    }

    fn delete_host(&self, actor: &Actor, id: &str) -> Result<()> {
        {
            let mut hosts = self.hosts_mut();
            let existing = hosts.get(id).ok_or_else(|| not_found("host", id))?;
            check_access(actor, "host", id, &existing.account_id)?;
            hosts.remove(id);
        }
        let orphaned: Vec<String> = {
            let mut probes = self.probes_mut();
            let ids: Vec<String> = probes
                .values()
                .filter(|p| p.host_id == id)
                .map(|p| p.id.clone())
                .collect();
            for probe_id in &ids {
                probes.remove(probe_id);
            }
            ids
        };
        for probe_id in orphaned {
            self.broadcaster.broadcast(PROBE_DELETED, json!({ "id": probe_id }));
        }
        self.broadcaster.broadcast(HOST_DELETED, json!({ "id": id }));
        Ok(())
    }
}
