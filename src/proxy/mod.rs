// src/proxy/mod.rs
mod proxy;
mod backend;
mod pool;

pub use proxy::{join_backend_path, rewrite_uri, ClientAddr, Proxy, ProxyError};
pub use backend::{Backend, BackendMetrics, BackendState, ConnectionGuard};
pub use pool::{PoolError, ServerPool};
