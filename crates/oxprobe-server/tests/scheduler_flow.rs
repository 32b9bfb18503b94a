mod common;

use chrono::Utc;
use common::{harness, probe, wait_for, Broken, Heartbeat, Panicky, Stats};
use oxprobe_collector::{Agent, Registry};
use oxprobe_server::scheduler::Scheduler;
use oxprobe_server::sink::Forwarder;
use oxprobe_common::types::Point;
use oxprobe_storage::database::LogDatabase;
use oxprobe_storage::error::Result as StoreResult;
use oxprobe_storage::model::{LOCALHOST_ID, SYSTEM_ACCOUNT};
use oxprobe_storage::{Actor, Host, MemoryStore, Probe, Scope, Store};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn local_probe(agent: Box<dyn Agent>, interval: chrono::Duration, due_now: bool) -> Probe {
    let mut probe = Probe::new(SYSTEM_ACCOUNT, LOCALHOST_ID, agent, interval);
    if due_now {
        probe.next_check = Some(Utc::now());
    }
    probe
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_runs_every_interval_for_three_seconds() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let agent = Box::new(Heartbeat::new(stats.clone(), Duration::ZERO));
    let p = local_probe(agent, chrono::Duration::seconds(1), false);
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    let started = Utc::now();
    let ran = tokio::time::timeout(Duration::from_secs(3), h.scheduler.run()).await;
    assert!(ran.is_err(), "run() returned");

    assert!(stats.gathers() >= 2, "only {} gathers", stats.gathers());
    let stored = probe(h.store.as_ref(), &id);
    let last_check = stored.last_check.unwrap();
    assert!(last_check > started + chrono::Duration::seconds(1));
    assert_eq!(stored.next_check, Some(last_check + chrono::Duration::seconds(1)));
    assert_eq!(stored.last_points.unwrap()[0].name, "beat");

    let written = h.db.points();
    assert!(written.len() >= 2);
    assert!(written.iter().all(|p| p.tags["host"] == LOCALHOST_ID && p.tags["host_id"] == LOCALHOST_ID));
    let counts: Vec<f64> = written.iter().filter_map(|p| p.fields["count"].as_f64()).collect();
    assert!(counts.windows(2).all(|w| w[0] < w[1]), "{counts:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_probe_is_never_started_twice() {
    let h = harness(Duration::from_millis(10));
    let stats = Arc::new(Stats::default());
    let agent = Box::new(Heartbeat::new(stats.clone(), Duration::from_millis(300)));
    let p = local_probe(agent, chrono::Duration::milliseconds(50), true);
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    assert!(h.scheduler.is_running(&id));
    for _ in 0..5 {
        assert_eq!(h.scheduler.dispatch(Utc::now() + chrono::Duration::seconds(1)), 0);
    }
    assert!(wait_for(Duration::from_secs(2), || !h.scheduler.is_running(&id)).await);
    assert_eq!(stats.gathers(), 1);

    let ran = tokio::time::timeout(Duration::from_millis(1500), h.scheduler.run()).await;
    assert!(ran.is_err());
    assert!(stats.gathers() >= 3, "only {} gathers", stats.gathers());
    assert_eq!(stats.max_active(), 1);
}

#[tokio::test]
async fn new_probes_get_a_jittered_first_check() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let interval = chrono::Duration::seconds(10);
    let now = Utc::now();

    let fresh = local_probe(Box::new(Heartbeat::new(stats.clone(), Duration::ZERO)), interval, false);
    let mut stale = local_probe(Box::new(Heartbeat::new(stats.clone(), Duration::ZERO)), interval, false);
    stale.next_check = Some(now - chrono::Duration::seconds(25));
    let (fresh_id, stale_id) = (fresh.id.clone(), stale.id.clone());
    h.store.add_probe(&Actor::System, fresh).unwrap();
    h.store.add_probe(&Actor::System, stale).unwrap();

    assert_eq!(h.scheduler.dispatch(now), 0);
    for id in [&fresh_id, &stale_id] {
        let next = probe(h.store.as_ref(), id).next_check.unwrap();
        assert!(next >= now && next < now + interval, "{next} outside [{now}, +10s)");
    }
    assert_eq!(stats.gathers(), 0);
}

#[tokio::test]
async fn overdue_probe_within_two_intervals_runs_immediately() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let now = Utc::now();
    let mut p = local_probe(
        Box::new(Heartbeat::new(stats.clone(), Duration::ZERO)),
        chrono::Duration::seconds(10),
        false,
    );
    p.next_check = Some(now - chrono::Duration::seconds(15));
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(now), 1);
    assert!(wait_for(Duration::from_secs(2), || probe(h.store.as_ref(), &id).last_check.is_some()).await);
    assert_eq!(stats.gathers(), 1);
}

#[tokio::test]
async fn failed_gather_is_recorded_and_rescheduled() {
    let h = harness(Duration::from_millis(100));
    let p = local_probe(Box::new(Broken), chrono::Duration::seconds(30), true);
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    assert!(wait_for(Duration::from_secs(2), || probe(h.store.as_ref(), &id).last_check.is_some()).await);
    assert!(wait_for(Duration::from_secs(1), || h.scheduler.in_flight_count() == 0).await);

    let stored = probe(h.store.as_ref(), &id);
    assert!(stored.last_points.is_none());
    assert_eq!(stored.next_check, stored.last_check.map(|t| t + chrono::Duration::seconds(30)));
    assert!(h.db.points().is_empty());
}

#[tokio::test]
async fn panicking_agent_does_not_leak_its_in_flight_marker() {
    let h = harness(Duration::from_millis(100));
    let p = local_probe(Box::new(Panicky), chrono::Duration::seconds(30), true);
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    assert!(wait_for(Duration::from_secs(2), || probe(h.store.as_ref(), &id).last_check.is_some()).await);
    assert!(wait_for(Duration::from_secs(1), || !h.scheduler.is_running(&id)).await);

    let mut again = probe(h.store.as_ref(), &id);
    again.next_check = Some(Utc::now());
    h.store.update_probe(&Actor::System, &again).unwrap();
    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_made_during_a_run_survive_it() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let p = local_probe(
        Box::new(Heartbeat::new(stats.clone(), Duration::from_millis(300))),
        chrono::Duration::seconds(10),
        true,
    );
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    let mut edited = probe(h.store.as_ref(), &id);
    edited.interval = chrono::Duration::seconds(600);
    edited.agent = local_probe(Box::new(Heartbeat::new(stats.clone(), Duration::ZERO)), edited.interval, false).agent;
    h.store.update_probe(&Actor::System, &edited).unwrap();

    assert!(wait_for(Duration::from_secs(2), || !h.scheduler.is_running(&id)).await);
    let stored = probe(h.store.as_ref(), &id);
    assert_eq!(stored.interval, chrono::Duration::seconds(600));
    assert!(Arc::ptr_eq(&stored.agent, &edited.agent));
    let last_check = stored.last_check.unwrap();
    assert_eq!(stored.next_check, Some(last_check + chrono::Duration::seconds(600)));
    assert!(stored.last_points.is_some());
}

#[tokio::test]
async fn probe_deleted_during_a_run_stays_deleted() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let p = local_probe(
        Box::new(Heartbeat::new(stats.clone(), Duration::from_millis(200))),
        chrono::Duration::seconds(10),
        true,
    );
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    h.store.delete_probe(&Actor::System, &id).unwrap();
    assert!(wait_for(Duration::from_secs(2), || !h.scheduler.is_running(&id)).await);
    assert!(h.store.get_probe(&Actor::System, &id).is_err());
    assert!(h.db.points().is_empty());
}

/// Serves probe listings from a fixed snapshot; every other call goes to
/// the wrapped store.
struct StaleListing {
    inner: Arc<MemoryStore>,
    snapshot: Mutex<Vec<Probe>>,
}

impl Store for StaleListing {
    fn get_all_probes(&self, _actor: &Actor, _scope: &Scope) -> StoreResult<Vec<Probe>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn get_probe(&self, actor: &Actor, id: &str) -> StoreResult<Probe> {
        self.inner.get_probe(actor, id)
    }

    fn add_probe(&self, actor: &Actor, probe: Probe) -> StoreResult<()> {
        self.inner.add_probe(actor, probe)
    }

    fn update_probe(&self, actor: &Actor, probe: &Probe) -> StoreResult<()> {
        self.inner.update_probe(actor, probe)
    }

    fn delete_probe(&self, actor: &Actor, id: &str) -> StoreResult<()> {
        self.inner.delete_probe(actor, id)
    }

    fn record_run(
        &self,
        actor: &Actor,
        id: &str,
        checked_at: chrono::DateTime<Utc>,
        points: Option<Vec<Point>>,
    ) -> StoreResult<()> {
        self.inner.record_run(actor, id, checked_at, points)
    }

    fn reschedule(&self, actor: &Actor, id: &str, next_check: chrono::DateTime<Utc>) -> StoreResult<()> {
        self.inner.reschedule(actor, id, next_check)
    }

    fn get_host(&self, actor: &Actor, id: &str) -> StoreResult<Host> {
        self.inner.get_host(actor, id)
    }

    fn get_all_hosts(&self, actor: &Actor, scope: &Scope) -> StoreResult<Vec<Host>> {
        self.inner.get_all_hosts(actor, scope)
    }

    fn add_host(&self, actor: &Actor, host: Host) -> StoreResult<()> {
        self.inner.add_host(actor, host)
    }

    fn update_host(&self, actor: &Actor, host: &Host) -> StoreResult<()> {
        self.inner.update_host(actor, host)
    }

    fn delete_host(&self, actor: &Actor, id: &str) -> StoreResult<()> {
        self.inner.delete_host(actor, id)
    }
}

#[tokio::test]
async fn stale_listing_does_not_rerun_a_finished_probe() {
    let h = harness(Duration::from_millis(100));
    let stats = Arc::new(Stats::default());
    let p = local_probe(
        Box::new(Heartbeat::new(stats.clone(), Duration::ZERO)),
        chrono::Duration::seconds(30),
        true,
    );
    let id = p.id.clone();
    h.store.add_probe(&Actor::System, p).unwrap();
    let snapshot = h.store.get_all_probes(&Actor::System, &Scope::All).unwrap();

    assert_eq!(h.scheduler.dispatch(Utc::now()), 1);
    assert!(wait_for(Duration::from_secs(2), || probe(h.store.as_ref(), &id).last_check.is_some()).await);
    assert!(wait_for(Duration::from_secs(1), || !h.scheduler.is_running(&id)).await);

    let mut registry = Registry::new();
    registry.register_transport("local", || Box::new(oxprobe_transport::local::LocalTransport::new()));
    let stale = Arc::new(StaleListing {
        inner: h.store.clone(),
        snapshot: Mutex::new(snapshot),
    });
    let forwarder = Forwarder::new(Arc::new(LogDatabase), 0, Duration::ZERO);
    let scheduler = Scheduler::new(stale, forwarder, &registry, Actor::System).unwrap();

    assert_eq!(scheduler.dispatch(Utc::now()), 0);
    assert_eq!(scheduler.in_flight_count(), 0);
    assert_eq!(stats.gathers(), 1);
}

#[test]
fn localhost_is_created_once() {
    let mut registry = Registry::new();
    registry.register_transport("local", || Box::new(oxprobe_transport::local::LocalTransport::new()));
    let store = Arc::new(MemoryStore::new());

    for _ in 0..2 {
        let forwarder = Forwarder::new(Arc::new(LogDatabase), 0, Duration::ZERO);
        Scheduler::new(store.clone(), forwarder, &registry, Actor::System).unwrap();
    }
    let hosts = store.get_all_hosts(&Actor::System, &Scope::All).unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, LOCALHOST_ID);
    assert_eq!(hosts[0].transport.name(), "local");
}

#[test]
fn scheduler_requires_a_local_transport() {
    let forwarder = Forwarder::new(Arc::new(LogDatabase), 0, Duration::ZERO);
    let store = Arc::new(MemoryStore::new());
    assert!(Scheduler::new(store, forwarder, &Registry::new(), Actor::System).is_err());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn builtin_load_agent_reports_through_the_sink() {
    use oxprobe_transport::ssh::SshPool;

    let registry = Registry::with_defaults(Arc::new(SshPool::new(Duration::from_secs(10))));
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(common::RecordingDatabase::default());
    let scheduler = Scheduler::new(
        store.clone(),
        Forwarder::new(db.clone(), 0, Duration::ZERO),
        &registry,
        Actor::System,
    )
    .unwrap();

    let agent = registry.decode_agent("load", &serde_json::Value::Null).unwrap();
    let p = local_probe(agent, chrono::Duration::seconds(60), true);
    let id = p.id.clone();
    store.add_probe(&Actor::System, p).unwrap();

    assert_eq!(scheduler.dispatch(Utc::now()), 1);
    assert!(wait_for(Duration::from_secs(5), || !db.points().is_empty()).await);
    let points = db.points();
    assert_eq!(points[0].tags["host"], LOCALHOST_ID);
    assert!(points[0].fields.contains_key("load1"));
    assert!(probe(store.as_ref(), &id).last_points.is_some());
}
