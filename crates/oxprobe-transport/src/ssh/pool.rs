use crate::error::Result;
use crate::Conn;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Clients older than this with no outstanding lease are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between reaper sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A shareable client handle the pool can hand out and eventually close.
pub trait PoolClient: Clone + Send + 'static {
    fn disconnect(&self);
}

impl PoolClient for ssh2::Session {
    fn disconnect(&self) {
        if let Err(e) = ssh2::Session::disconnect(self, None, "idle", None) {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

struct Entry<C> {
    client: Option<C>,
    /// Bumped whenever a new client is stored, so a stale lease cannot
    /// evict its replacement.
    generation: u64,
    last_use: Instant,
    ref_count: usize,
}

/// Reference-counted connection pool keyed by `(host, port, username)`.
///
/// Entries are never removed from the map; reaping only clears the client
/// handle so the next acquire dials again.
pub struct Pool<C> {
    entries: Mutex<HashMap<PoolKey, Entry<C>>>,
    idle_timeout: Duration,
}

impl<C: PoolClient> Pool<C> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Creates a shared pool and starts its reaper thread. The thread exits
    /// once the last `Arc` is dropped.
    pub fn start(idle_timeout: Duration, sweep_every: Duration) -> Arc<Self> {
        let pool = Arc::new(Self::new(idle_timeout));
        pool.spawn_reaper(sweep_every);
        pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, Entry<C>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns a lease on a live client for `key`, dialing through
    /// `connect` when none is cached.
    pub fn acquire<F>(self: &Arc<Self>, key: &PoolKey, connect: F) -> Result<Lease<C>>
    where
        F: FnOnce(&PoolKey) -> Result<C>,
    {
        if let Some((client, generation)) = self.try_reuse(key) {
            return Ok(self.lease(key, client, generation));
        }

        // Dial without holding the lock so other hosts are not blocked.
        let fresh = connect(key)?;

        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            client: None,
            generation: 0,
            last_use: Instant::now(),
            ref_count: 0,
        });
        let client = match &entry.client {
            Some(existing) => {
                // Another caller won the race; keep theirs.
                fresh.disconnect();
                existing.clone()
            }
            None => {
                entry.generation += 1;
                entry.client = Some(fresh.clone());
                fresh
            }
        };
        entry.ref_count += 1;
        entry.last_use = Instant::now();
        let generation = entry.generation;
        drop(entries);

        tracing::debug!(key = %key, "SSH connection established");
        Ok(self.lease(key, client, generation))
    }

    fn try_reuse(&self, key: &PoolKey) -> Option<(C, u64)> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        let client = entry.client.clone()?;
        entry.ref_count += 1;
        entry.last_use = Instant::now();
        Some((client, entry.generation))
    }

    fn lease(self: &Arc<Self>, key: &PoolKey, client: C, generation: u64) -> Lease<C> {
        Lease {
            pool: Arc::clone(self),
            key: key.clone(),
            client,
            generation,
            released: false,
        }
    }

    /// Drops the cached client for `key` if it is still the one handed out
    /// as `generation`, so the next acquire dials again. Outstanding leases
    /// keep their counts and release as usual.
    fn evict(&self, key: &PoolKey, generation: u64) -> bool {
        let evicted = {
            let mut entries = self.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.generation == generation => entry.client.take(),
                _ => None,
            }
        };
        match evicted {
            Some(client) => {
                tracing::debug!(key = %key, "Evicting broken SSH connection");
                client.disconnect();
                true
            }
            None => false,
        }
    }

    fn release(&self, key: &PoolKey) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_use = Instant::now();
        }
    }

    /// Closes clients idle for longer than the timeout with no leases.
    /// Returns how many were closed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut idle = Vec::new();
        {
            let mut entries = self.lock();
            for (key, entry) in entries.iter_mut() {
                if entry.ref_count == 0
                    && entry.client.is_some()
                    && now.saturating_duration_since(entry.last_use) > self.idle_timeout
                {
                    if let Some(client) = entry.client.take() {
                        idle.push((key.clone(), client));
                    }
                }
            }
        }
        for (key, client) in &idle {
            tracing::debug!(key = %key, "Closing idle SSH connection");
            client.disconnect();
        }
        idle.len()
    }

    fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(every);
            match weak.upgrade() {
                Some(pool) => {
                    pool.sweep(Instant::now());
                }
                None => break,
            }
        })
    }

    pub fn ref_count(&self, key: &PoolKey) -> Option<usize> {
        self.lock().get(key).map(|e| e.ref_count)
    }

    pub fn is_connected(&self, key: &PoolKey) -> bool {
        self.lock().get(key).is_some_and(|e| e.client.is_some())
    }
}

/// A counted claim on a pooled client. Released once, on `release` or drop.
pub struct Lease<C: PoolClient> {
    pool: Arc<Pool<C>>,
    key: PoolKey,
    client: C,
    generation: u64,
    released: bool,
}

impl<C: PoolClient> Lease<C> {
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Marks the leased client as broken. The pool closes it and dials a
    /// new one on the next acquire; the lease itself stays counted until
    /// released.
    pub fn invalidate(&self) -> bool {
        self.pool.evict(&self.key, self.generation)
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.key);
        }
    }
}

impl<C: PoolClient> Drop for Lease<C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A stream that holds a pool lease for as long as it is open.
pub struct PooledConn<S, C: PoolClient> {
    inner: Option<S>,
    lease: Lease<C>,
}

impl<S, C: PoolClient> PooledConn<S, C> {
    pub fn new(inner: S, lease: Lease<C>) -> Self {
        Self {
            inner: Some(inner),
            lease,
        }
    }

    fn stream(&mut self) -> io::Result<&mut S> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }
}

impl<S: Read, C: PoolClient> Read for PooledConn<S, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl<S: Write, C: PoolClient> Write for PooledConn<S, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl<S: Read + Write + Send, C: PoolClient> Conn for PooledConn<S, C> {
    fn close(&mut self) -> Result<()> {
        self.inner.take();
        self.lease.release();
        Ok(())
    }
}
