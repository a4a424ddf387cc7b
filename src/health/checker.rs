// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{join_backend_path, Backend, ServerPool};
use anyhow::Result;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Checks every backend on its own task and keeps each backend's health flag
/// current. Check failures never reach request callers.
pub struct HealthChecker {
    interval: Duration,
    config: HealthCheckConfig,
    pool: ServerPool,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub healthy: bool,
    pub status: Option<StatusCode>,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        interval: Duration,
        config: HealthCheckConfig,
        pool: ServerPool,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            interval,
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawns one probing task per backend. The handles resolve once
    /// [`HealthChecker::shutdown`] has been called.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting health checker for {} backends with interval {:?}",
            self.pool.len(),
            self.interval
        );

        self.pool
            .backends()
            .iter()
            .map(|backend| {
                let checker = Arc::clone(self);
                let backend = Arc::clone(backend);
                tokio::spawn(async move { checker.watch_backend(backend).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn watch_backend(&self, backend: Arc<Backend>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        // First check fires one interval after startup; until then the
        // backend keeps its optimistic healthy flag.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_backend(&backend).await;
                }
            }
        }

        debug!("Health checks for {} stopped", backend.id);
    }

    /// Issues one health request and applies the outcome to the backend's flag:
    /// no response or a 5xx marks it unhealthy, anything below 500 healthy.
    pub async fn check_backend(&self, backend: &Backend) -> HealthCheckResult {
        let start = std::time::Instant::now();

        let (healthy, status, error) = match self.fetch_status(backend).await {
            Ok(status) if status.as_u16() >= 500 => {
                (false, Some(status), Some(format!("HTTP {}", status)))
            }
            Ok(status) => (true, Some(status), None),
            Err(e) => (false, None, Some(e)),
        };

        let response_time_ms = start.elapsed().as_millis() as u64;
        let was_healthy = backend.update_health(healthy);

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(&backend.id, healthy);
            metrics.update_backend_counts(self.pool.healthy_count(), self.pool.len());
        }

        match (was_healthy, healthy) {
            (true, false) => warn!(
                "Backend {} is now unhealthy: {}",
                backend.id,
                error.as_deref().unwrap_or("unknown error")
            ),
            (false, true) => info!("Backend {} is healthy again", backend.id),
            _ => debug!(
                "Backend {} check: healthy={} in {}ms",
                backend.id, healthy, response_time_ms
            ),
        }

        HealthCheckResult {
            backend_id: backend.id.clone(),
            healthy,
            status,
            response_time_ms,
            error,
        }
    }

    async fn fetch_status(&self, backend: &Backend) -> Result<StatusCode, String> {
        let url = match &self.config.path {
            Some(path) => join_backend_path(&backend.url, path),
            None => backend.url.clone(),
        };

        let response = match timeout(self.config.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("Request timeout".to_string()),
        };

        let status = response.status();

        // Drain the body so the connection can be reused by the next check.
        if let Err(e) = response.bytes().await {
            warn!("Error draining health response from {}: {}", backend.id, e);
        }

        Ok(status)
    }
}
