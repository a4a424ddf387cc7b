// src/proxy/backend.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// Mutable part of a backend. Both fields live under one guard so a health check
/// update and a connection count update never interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendState {
    pub active_connections: usize,
    pub healthy: bool,
}

impl Default for BackendState {
    fn default() -> Self {
        // Optimistic until the first health check lands.
        Self {
            active_connections: 0,
            healthy: true,
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,

    state: Mutex<BackendState>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl Backend {
    pub fn new(url: Url) -> Self {
        let id = format!(
            "{}:{}",
            url.host_str().unwrap_or("unknown"),
            url.port_or_known_default().unwrap_or(80)
        );

        Self {
            id,
            url,
            state: Mutex::new(BackendState::default()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    /// Runs `f` with exclusive access to the backend state. The guard is
    /// released when `f` returns; never hold it across an await point.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        // The state is two plain values, a panicking holder can't leave it torn.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn snapshot(&self) -> BackendState {
        self.with_lock(|state| *state)
    }

    pub fn active_connections(&self) -> usize {
        self.with_lock(|state| state.active_connections)
    }

    pub fn is_healthy(&self) -> bool {
        self.with_lock(|state| state.healthy)
    }

    /// Sets the health flag and returns the previous value.
    pub fn update_health(&self, healthy: bool) -> bool {
        self.with_lock(|state| std::mem::replace(&mut state.healthy, healthy))
    }

    /// Counts one in-flight request against this backend. The count is
    /// released when the returned guard drops.
    pub fn acquire_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.with_lock(|state| state.active_connections += 1);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    fn release_connection(&self) {
        self.with_lock(|state| {
            debug_assert!(state.active_connections > 0, "connection count underflow");
            state.active_connections = state.active_connections.saturating_sub(1);
        });
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_metrics(&self) -> BackendMetrics {
        BackendMetrics {
            active_connections: self.active_connections(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Holds one unit of a backend's active connection count.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.release_connection();
    }
}

#[derive(Debug)]
pub struct BackendMetrics {
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str) -> Arc<Backend> {
        Arc::new(Backend::new(url.parse().unwrap()))
    }

    #[test]
    fn starts_healthy_and_idle() {
        let b = backend("http://127.0.0.1:8001");
        assert_eq!(
            b.snapshot(),
            BackendState {
                active_connections: 0,
                healthy: true
            }
        );
        assert_eq!(b.id, "127.0.0.1:8001");
    }

    #[test]
    fn id_uses_default_port() {
        assert_eq!(backend("https://example.com").id, "example.com:443");
    }

    #[test]
    fn guard_brackets_connection_count() {
        let b = backend("http://127.0.0.1:8001");

        let first = b.acquire_connection();
        let second = b.acquire_connection();
        assert_eq!(b.active_connections(), 2);

        drop(first);
        assert_eq!(b.active_connections(), 1);
        drop(second);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn update_health_returns_previous_flag() {
        let b = backend("http://127.0.0.1:8001");
        assert!(b.update_health(false));
        assert!(!b.update_health(true));
        assert!(b.is_healthy());
    }

    #[test]
    fn record_request_tracks_failures() {
        let b = backend("http://127.0.0.1:8001");
        b.record_request(true);
        b.record_request(false);

        let metrics = b.get_metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[test]
    fn concurrent_guards_settle_at_zero() {
        let b = backend("http://127.0.0.1:8001");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = b.acquire_connection();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(b.active_connections(), 0);
    }
}
