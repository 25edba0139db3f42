use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Counters {
    connected: usize,
    idle_since: Option<Instant>,
}

/// Tracks live connections so the server can tell how long it has been idle.
#[derive(Debug)]
pub struct ConnectionStats {
    inner: Mutex<Counters>,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters {
                connected: 0,
                idle_since: Some(Instant::now()),
            }),
        }
    }

    pub fn client_connected(&self) {
        let mut counters = self.inner.lock();
        counters.connected += 1;
        counters.idle_since = None;
    }

    pub fn client_disconnected(&self) {
        let mut counters = self.inner.lock();
        counters.connected = counters.connected.saturating_sub(1);
        if counters.connected == 0 {
            counters.idle_since = Some(Instant::now());
        }
    }

    pub fn connected(&self) -> usize {
        self.inner.lock().connected
    }

    /// True once no client has been connected for at least `secs` seconds.
    pub fn idle_duration_exceeds(&self, secs: u64) -> bool {
        let counters = self.inner.lock();
        match counters.idle_since {
            Some(since) => since.elapsed() >= Duration::from_secs(secs),
            None => false,
        }
    }
}
