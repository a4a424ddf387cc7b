// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::ClientAddr;
use crate::server::listener::bind_tcp;
use anyhow::{anyhow, Result};
use hyper::{server::conn::Http, service::service_fn, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::{Service, ServiceExt};

/// Builder pattern so `main.rs` can inject its Proxy (or any handler).
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
    drain_timeout: Duration,
}

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Inject your request handler (usually wraps `proxy::Proxy`).
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// How long shutdown waits for open connections to finish their
    /// in-flight requests.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_tcp(self.addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serves on an already bound listener, one Tokio task per connection.
    /// Once `shutdown` resolves it stops accepting, asks every open
    /// connection to close after its current request and waits for them,
    /// bounded by the drain timeout.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .ok_or_else(|| anyhow!("handler must be set via with_handler()"))?;

        tracing::info!("HTTP server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        // Each connection task holds a receiver; the sender sees `closed()`
        // once all of them have finished.
        let (drain_tx, _) = watch::channel(());

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                },
            };

            let handler = handler.clone();
            let mut drain_rx = drain_tx.subscribe();
            tokio::spawn(async move {
                let svc = service_fn(move |mut req: Request<Body>| {
                    req.extensions_mut().insert(ClientAddr(peer));
                    handler.clone().oneshot(req)
                });

                let conn = Http::new().serve_connection(stream, svc);
                tokio::pin!(conn);

                let mut draining = false;
                loop {
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                tracing::warn!(%peer, %err, "connection error");
                            }
                            break;
                        }
                        _ = drain_rx.changed(), if !draining => {
                            draining = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                }
            });
        }

        drop(listener);
        tracing::info!("HTTP server no longer accepting connections, draining");
        let _ = drain_tx.send(());

        if tokio::time::timeout(self.drain_timeout, drain_tx.closed())
            .await
            .is_err()
        {
            tracing::warn!(
                "Connections still open after {:?}, shutting down anyway",
                self.drain_timeout
            );
        }

        Ok(())
    }
}
