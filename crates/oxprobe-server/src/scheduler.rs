//! Probe scheduling.
//!
//! A single loop ticks at a fixed period, picks the probes whose
//! `next_check` has come and runs each one on its own task. A probe id is
//! held in the in-flight set for the whole run so that a slow probe is never
//! started twice.

use crate::sink::Forwarder;
use chrono::{DateTime, Utc};
use oxprobe_collector::Registry;
use oxprobe_common::types::Point;
use oxprobe_storage::error::StorageError;
use oxprobe_storage::model::{LOCALHOST_ID, SYSTEM_ACCOUNT};
use oxprobe_storage::{Actor, Host, Probe, Scope, Store};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Where a probe stands relative to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Never scheduled, or so far behind that it is treated as new. Gets a
    /// jittered first `next_check`.
    Unscheduled,
    /// Waiting for `next_check`.
    Idle,
    Due,
    Running,
}

/// Classifies `probe` at `now`.
///
/// A `next_check` more than two intervals in the past counts as
/// unscheduled so that probes restored from an old record do not all fire
/// on the same tick.
pub fn probe_state(probe: &Probe, now: DateTime<Utc>, running: bool) -> ProbeState {
    if running {
        return ProbeState::Running;
    }
    match probe.next_check {
        None => ProbeState::Unscheduled,
        Some(next) if now - next > probe.interval * 2 => ProbeState::Unscheduled,
        Some(next) if now >= next => ProbeState::Due,
        Some(_) => ProbeState::Idle,
    }
}

/// First check time for a new probe: uniformly in `[now, now + interval)`.
pub fn jittered_start<R: Rng>(now: DateTime<Utc>, interval: chrono::Duration, rng: &mut R) -> DateTime<Utc> {
    let millis = interval.num_milliseconds();
    if millis <= 0 {
        return now;
    }
    now + chrono::Duration::milliseconds(rng.gen_range(0..millis))
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Membership of one probe id in the in-flight set. Dropping the guard
/// removes the id, including when the owning task panics.
struct InFlightGuard {
    set: InFlight,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string());
        inserted.then(|| Self {
            set: set.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    forwarder: Arc<Forwarder>,
    actor: Actor,
    tick: Duration,
    in_flight: InFlight,
}

impl Scheduler {
    /// Creates a scheduler acting as `actor` and makes sure the localhost
    /// host exists, building its transport through `registry`.
    pub fn new(
        store: Arc<dyn Store>,
        forwarder: Forwarder,
        registry: &Registry,
        actor: Actor,
    ) -> anyhow::Result<Self> {
        ensure_localhost(store.as_ref(), registry)?;
        Ok(Self {
            store,
            forwarder: Arc::new(forwarder),
            actor,
            tick: DEFAULT_TICK,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Ticks forever, dispatching due probes.
    pub async fn run(&self) {
        tracing::info!(tick_millis = self.tick.as_millis() as u64, "Probe scheduler started");

        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.dispatch(Utc::now());
        }
    }

    /// Runs one scheduling pass at `now` and returns how many probes were
    /// started. Must be called from within a tokio runtime.
    pub fn dispatch(&self, now: DateTime<Utc>) -> usize {
        let probes = match self.store.get_all_probes(&self.actor, &Scope::All) {
            Ok(probes) => probes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load probes");
                return 0;
            }
        };

        let mut started = 0;
        for probe in probes {
            match probe_state(&probe, now, self.is_running(&probe.id)) {
                ProbeState::Running | ProbeState::Idle => {}
                ProbeState::Unscheduled => {
                    let next = jittered_start(now, probe.interval, &mut rand::thread_rng());
                    if let Err(e) = self.store.reschedule(&self.actor, &probe.id, next) {
                        tracing::warn!(probe_id = %probe.id, error = %e, "Failed to schedule probe");
                    } else {
                        tracing::debug!(probe_id = %probe.id, next_check = %next, "Probe scheduled");
                    }
                }
                ProbeState::Due => {
                    let Some(guard) = InFlightGuard::acquire(&self.in_flight, &probe.id) else {
                        continue;
                    };
                    // The listing may predate a run that finished since.
                    let probe = match self.store.get_probe(&self.actor, &probe.id) {
                        Ok(fresh) if probe_state(&fresh, now, false) == ProbeState::Due => fresh,
                        Ok(_) | Err(StorageError::NotFound { .. }) => continue,
                        Err(e) => {
                            tracing::warn!(probe_id = %probe.id, error = %e, "Failed to reload probe");
                            continue;
                        }
                    };
                    let store = self.store.clone();
                    let forwarder = self.forwarder.clone();
                    let actor = self.actor.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        execute(store.as_ref(), &forwarder, &actor, probe).await;
                    });
                    started += 1;
                }
            }
        }
        started
    }

    pub fn is_running(&self, probe_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(probe_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn ensure_localhost(store: &dyn Store, registry: &Registry) -> anyhow::Result<()> {
    match store.get_host(&Actor::System, LOCALHOST_ID) {
        Ok(_) => return Ok(()),
        Err(StorageError::NotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    let host = Host {
        id: LOCALHOST_ID.to_string(),
        account_id: SYSTEM_ACCOUNT.to_string(),
        name: LOCALHOST_ID.to_string(),
        transport: Arc::from(registry.construct_transport("local")?),
    };
    match store.add_host(&Actor::System, host) {
        Ok(()) => {
            tracing::info!(host_id = LOCALHOST_ID, "Created localhost host");
            Ok(())
        }
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// One run of `probe`: gather on the blocking pool, record the outcome in
/// the store, then forward the points.
///
/// Only the run outcome is written back, so edits made to the probe while
/// it was running are kept.
async fn execute(store: &dyn Store, forwarder: &Forwarder, actor: &Actor, probe: Probe) {
    let host = match store.get_host(actor, &probe.host_id) {
        Ok(host) => host,
        Err(e) => {
            tracing::warn!(probe_id = %probe.id, host_id = %probe.host_id, error = %e, "Probe host unavailable");
            if let Err(e) = store.reschedule(actor, &probe.id, Utc::now() + probe.interval) {
                tracing::warn!(probe_id = %probe.id, error = %e, "Failed to update probe");
            }
            return;
        }
    };

    let points = gather(&probe, &host).await;

    match store.record_run(actor, &probe.id, Utc::now(), points.clone()) {
        Ok(()) => {}
        Err(StorageError::NotFound { .. }) => {
            tracing::debug!(probe_id = %probe.id, "Probe deleted while running");
            return;
        }
        Err(e) => tracing::warn!(probe_id = %probe.id, error = %e, "Failed to update probe"),
    }

    if let Some(points) = points {
        if let Err(e) = forwarder.send(points, &host).await {
            tracing::debug!(probe_id = %probe.id, error = %e, "Points not forwarded");
        }
    }
}

async fn gather(probe: &Probe, host: &Host) -> Option<Vec<Point>> {
    let agent = probe.agent.clone();
    let transport = host.transport.clone();
    let started = std::time::Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let mut agent = agent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        agent.gather(&*transport)?;
        Ok::<_, anyhow::Error>((agent.name().to_string(), agent.points()))
    })
    .await;

    match result {
        Ok(Ok((agent, points))) => {
            tracing::debug!(
                probe_id = %probe.id,
                host = %host.name,
                agent = %agent,
                points = points.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Probe completed"
            );
            Some(points)
        }
        Ok(Err(e)) => {
            tracing::warn!(probe_id = %probe.id, host = %host.name, error = %e, "Probe failed");
            None
        }
        Err(e) => {
            tracing::error!(probe_id = %probe.id, host = %host.name, error = %e, "Probe task aborted");
            None
        }
    }
}
