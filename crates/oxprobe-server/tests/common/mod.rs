#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use oxprobe_collector::{Agent, Registry};
use oxprobe_common::types::{Doc, Point};
use oxprobe_server::scheduler::Scheduler;
use oxprobe_server::sink::Forwarder;
use oxprobe_storage::database::Database;
use oxprobe_storage::{Actor, MemoryStore, Store};
use oxprobe_transport::Transport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared counters observed by the test agents.
#[derive(Default)]
pub struct Stats {
    pub gathers: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Stats {
    pub fn gathers(&self) -> usize {
        self.gathers.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Emits one `beat` point per gather, optionally sleeping first.
pub struct Heartbeat {
    pub stats: Arc<Stats>,
    pub delay: Duration,
    count: usize,
}

impl Heartbeat {
    pub fn new(stats: Arc<Stats>, delay: Duration) -> Self {
        Self {
            stats,
            delay,
            count: 0,
        }
    }
}

impl Agent for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn gather(&mut self, _transport: &dyn Transport) -> anyhow::Result<()> {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.gathers.fetch_add(1, Ordering::SeqCst);
        self.count += 1;
        Ok(())
    }

    fn points(&self) -> Vec<Point> {
        vec![Point::new("beat", Utc::now()).field("count", self.count as f64)]
    }

    fn doc(&self) -> Doc {
        Doc::new("Counts its own gathers.").metric("beat.count", "Gathers so far")
    }
}

/// Always fails to gather.
pub struct Broken;

impl Agent for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn gather(&mut self, _transport: &dyn Transport) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }

    fn points(&self) -> Vec<Point> {
        Vec::new()
    }

    fn doc(&self) -> Doc {
        Doc::new("Fails every gather.")
    }
}

/// Panics inside gather, poisoning its own mutex.
pub struct Panicky;

impl Agent for Panicky {
    fn name(&self) -> &str {
        "panicky"
    }

    fn gather(&mut self, _transport: &dyn Transport) -> anyhow::Result<()> {
        panic!("agent bug")
    }

    fn points(&self) -> Vec<Point> {
        Vec::new()
    }

    fn doc(&self) -> Doc {
        Doc::new("Panics on gather.")
    }
}

/// Keeps every batch it is given.
#[derive(Default)]
pub struct RecordingDatabase {
    pub batches: Mutex<Vec<Vec<Point>>>,
}

impl RecordingDatabase {
    pub fn points(&self) -> Vec<Point> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    async fn write_points(&self, points: &[Point]) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(points.to_vec());
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub db: Arc<RecordingDatabase>,
    pub scheduler: Scheduler,
}

/// A scheduler over a fresh store with only the `local` transport
/// registered.
pub fn harness(tick: Duration) -> Harness {
    let mut registry = Registry::new();
    registry.register_transport("local", || Box::new(oxprobe_transport::local::LocalTransport::new()));

    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(RecordingDatabase::default());
    let forwarder = Forwarder::new(db.clone(), 0, Duration::ZERO);
    let scheduler = Scheduler::new(store.clone(), forwarder, &registry, Actor::System)
        .unwrap()
        .with_tick(tick);
    Harness { store, db, scheduler }
}

/// Polls `check` every 10ms until it holds or `limit` passes.
pub async fn wait_for<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn probe(store: &dyn Store, id: &str) -> oxprobe_storage::Probe {
    store.get_probe(&Actor::System, id).unwrap()
}
