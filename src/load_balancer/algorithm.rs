// src/load_balancer/algorithm.rs
use crate::proxy::{Backend, ServerPool};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no healthy backend available")]
    NoHealthyBackend,
}

pub trait LoadBalancer: Send + Sync {
    fn select_backend(&self, pool: &ServerPool) -> Result<Arc<Backend>, SelectionError>;

    fn name(&self) -> &'static str;
}
