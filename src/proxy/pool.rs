// src/proxy/pool.rs
use super::backend::{Backend, BackendState};
use std::sync::Arc;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend pool is empty")]
    Empty,
}

/// Fixed, ordered set of backends. Built once at startup and shared by the
/// dispatcher and the health checker; never resized afterwards.
#[derive(Debug, Clone)]
pub struct ServerPool {
    backends: Arc<[Arc<Backend>]>,
}

impl ServerPool {
    pub fn new(urls: impl IntoIterator<Item = Url>) -> Result<Self, PoolError> {
        let backends: Vec<Arc<Backend>> = urls
            .into_iter()
            .map(|url| Arc::new(Backend::new(url)))
            .collect();

        if backends.is_empty() {
            return Err(PoolError::Empty);
        }

        tracing::info!("Backend pool ready with {} servers", backends.len());
        Ok(Self {
            backends: backends.into(),
        })
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false for a constructed pool; kept for slice-like ergonomics.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    /// Per-backend copies of the guarded state, each taken under its own
    /// lock. Not a consistent cut across the pool.
    pub fn snapshot(&self) -> Vec<(Url, BackendState)> {
        self.backends
            .iter()
            .map(|b| (b.url.clone(), b.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(raw: &[&str]) -> Vec<Url> {
        raw.iter().map(|u| u.parse().unwrap()).collect()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(ServerPool::new(Vec::new()), Err(PoolError::Empty)));
    }

    #[test]
    fn keeps_configuration_order() {
        let pool = ServerPool::new(urls(&["http://a:1", "http://b:2", "http://c:3"])).unwrap();

        let ids: Vec<_> = pool.backends().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["a:1", "b:2", "c:3"]);
        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
    }

    #[test]
    fn clones_share_backend_state() {
        let pool = ServerPool::new(urls(&["http://a:1"])).unwrap();
        let other = pool.clone();

        pool.get(0).unwrap().update_health(false);
        assert!(!other.get(0).unwrap().is_healthy());
        assert_eq!(other.healthy_count(), 0);
    }

    #[test]
    fn snapshot_reports_each_backend() {
        let pool = ServerPool::new(urls(&["http://a:1", "http://b:2"])).unwrap();
        let _guard = pool.get(1).unwrap().acquire_connection();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].1.active_connections, 0);
        assert_eq!(snapshot[1].1.active_connections, 1);
        assert!(snapshot.iter().all(|(_, state)| state.healthy));
    }
}
