use crate::error::Result;
use crate::model::{Host, Probe};
use chrono::{DateTime, Utc};
use oxprobe_common::types::Point;

/// The principal on whose behalf a store call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Internal callers such as the scheduler. Sees every account.
    System,
    /// A tenant. Sees only entities whose `account_id` matches.
    Account(String),
}

impl Actor {
    pub fn can_access(&self, account_id: &str) -> bool {
        match self {
            Actor::System => true,
            Actor::Account(own) => own == account_id,
        }
    }
}

/// Narrows a listing beyond what the actor may see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    All,
    /// Only entities of this account.
    Account(String),
    /// Only probes bound to this host. Hosts are matched by id.
    Host(String),
}

/// Persistence of hosts and probes.
///
/// Implementations must be safe to share across threads because the
/// scheduler reads and writes probes from many concurrent tasks.
pub trait Store: Send + Sync {
    fn get_all_probes(&self, actor: &Actor, scope: &Scope) -> Result<Vec<Probe>>;

    fn get_probe(&self, actor: &Actor, id: &str) -> Result<Probe>;

    /// Inserts a probe. Its host must exist and be visible to `actor`.
    fn add_probe(&self, actor: &Actor, probe: Probe) -> Result<()>;

    /// Replaces the stored probe with the same id.
    fn update_probe(&self, actor: &Actor, probe: &Probe) -> Result<()>;

    fn delete_probe(&self, actor: &Actor, id: &str) -> Result<()>;

    /// Stores the outcome of one run of probe `id`: `last_check` becomes
    /// `checked_at`, `next_check` one stored interval later and
    /// `last_points` is replaced. The probe definition is left as stored.
    fn record_run(
        &self,
        actor: &Actor,
        id: &str,
        checked_at: DateTime<Utc>,
        points: Option<Vec<Point>>,
    ) -> Result<()>;

    /// Sets only `next_check` of probe `id`.
    fn reschedule(&self, actor: &Actor, id: &str, next_check: DateTime<Utc>) -> Result<()>;

    fn get_host(&self, actor: &Actor, id: &str) -> Result<Host>;

    fn get_all_hosts(&self, actor: &Actor, scope: &Scope) -> Result<Vec<Host>>;

    fn add_host(&self, actor: &Actor, host: Host) -> Result<()>;

    fn update_host(&self, actor: &Actor, host: &Host) -> Result<()>;

    /// Deletes a host together with every probe bound to it.
    fn delete_host(&self, actor: &Actor, id: &str) -> Result<()>;
}
