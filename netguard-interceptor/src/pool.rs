//! Upstream connection pool. Grounded on
//! `ando_proxy::proxy::ConnPool` — at most one cached connection per
//! target, newer `put` supersedes older — adapted from a thread-local
//! `HashMap<String, VecDeque<TcpStream>>` (monoio) to a `DashMap` guarding
//! a single slot per target so it can be shared across tokio tasks.

use dashmap::DashMap;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct PooledConn {
    stream: TcpStream,
    idle_since: Instant,
}

/// One cached connection per target address, guarded by a per-target
/// mutex so concurrent requests to different hosts never block each
/// other on the same lock.
pub struct ConnPool {
    slots: DashMap<String, Mutex<Option<PooledConn>>>,
    idle_timeout: Duration,
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl ConnPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { slots: DashMap::new(), idle_timeout }
    }

    /// Take the cached connection for `target`, if any, validating it
    /// with a nonblocking peek for peer-close before handing it back.
    pub async fn take(&self, target: &str) -> Option<TcpStream> {
        let slot = self.slots.get(target)?;
        let mut guard = slot.lock().await;
        let pooled = guard.take()?;
        drop(guard);

        if pooled.idle_since.elapsed() > self.idle_timeout {
            return None;
        }

        let mut buf = [0u8; 1];
        match pooled.stream.try_read(&mut buf) {
            Ok(0) => None, // peer closed
            Err(e) if e.kind() == ErrorKind::WouldBlock => Some(pooled.stream),
            Ok(_) => None,  // unexpected data waiting — treat as stale
            Err(_) => None, // any other error — treat as stale, caller dials fresh
        }
    }

    /// Cache `stream` for future reuse, superseding (and dropping) any
    /// connection already cached for `target`.
    pub async fn put(&self, target: String, stream: TcpStream) {
        let slot = self.slots.entry(target).or_insert_with(|| Mutex::new(None));
        let mut guard = slot.lock().await;
        *guard = Some(PooledConn { stream, idle_since: Instant::now() });
    }

    /// Drop every connection idle past `idle_timeout`. Intended to run on
    /// a `tokio::time::interval` background task for the pool's lifetime.
    pub async fn sweep(&self) {
        for slot in self.slots.iter() {
            let mut guard = slot.value().lock().await;
            if let Some(pooled) = guard.as_ref() {
                if pooled.idle_since.elapsed() > self.idle_timeout {
                    *guard = None;
                }
            }
        }
    }

    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
