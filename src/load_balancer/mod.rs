// src/load_balancer/mod.rs
mod algorithm;
mod least_connections;

pub use algorithm::{LoadBalancer, SelectionError};
pub use least_connections::LeastConnectionsBalancer;

use crate::config::LoadBalancerConfig;
use std::sync::Arc;

pub fn create_load_balancer(config: &LoadBalancerConfig) -> Arc<dyn LoadBalancer> {
    Arc::new(LeastConnectionsBalancer::new(config.no_healthy_backend))
}
