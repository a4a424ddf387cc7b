// src/load_balancer/least_connections.rs
use crate::config::NoHealthyPolicy;
use crate::load_balancer::{LoadBalancer, SelectionError};
use crate::proxy::{Backend, ServerPool};
use std::sync::Arc;

/// Picks the healthy backend with the fewest in-flight requests. Ties go to
/// the backend listed first.
///
/// Each backend is locked on its own while scanning, so the answer is
/// best-effort under concurrent dispatch: two requests may land on the same
/// backend before either increment is visible.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer {
    policy: NoHealthyPolicy,
}

impl LeastConnectionsBalancer {
    pub fn new(policy: NoHealthyPolicy) -> Self {
        Self { policy }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select_backend(&self, pool: &ServerPool) -> Result<Arc<Backend>, SelectionError> {
        let mut best_healthy: Option<(usize, &Arc<Backend>)> = None;
        let mut best_any: Option<(usize, &Arc<Backend>)> = None;

        for backend in pool.backends() {
            let state = backend.snapshot();
            let load = state.active_connections;

            if state.healthy && best_healthy.map_or(true, |(min, _)| load < min) {
                best_healthy = Some((load, backend));
            }
            if best_any.map_or(true, |(min, _)| load < min) {
                best_any = Some((load, backend));
            }
        }

        match (best_healthy, self.policy) {
            (Some((_, backend)), _) => Ok(backend.clone()),
            (None, NoHealthyPolicy::LeastLoaded) => {
                let (_, backend) = best_any.ok_or(SelectionError::NoHealthyBackend)?;
                tracing::warn!(
                    "No healthy backend, falling back to least loaded {}",
                    backend.id
                );
                Ok(backend.clone())
            }
            (None, NoHealthyPolicy::Reject) => Err(SelectionError::NoHealthyBackend),
        }
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Builds a pool where each entry is `(healthy, active_connections)`.
    fn pool(entries: &[(bool, usize)]) -> ServerPool {
        let urls = (0..entries.len()).map(|i| format!("http://10.0.0.{}:80", i + 1).parse().unwrap());
        let pool = ServerPool::new(urls).unwrap();

        for (backend, &(healthy, active)) in pool.backends().iter().zip(entries) {
            backend.with_lock(|state| {
                state.healthy = healthy;
                state.active_connections = active;
            });
        }
        pool
    }

    fn index_of(pool: &ServerPool, chosen: &Arc<Backend>) -> usize {
        pool.backends()
            .iter()
            .position(|b| Arc::ptr_eq(b, chosen))
            .unwrap()
    }

    #[test]
    fn picks_fewest_connections() {
        let pool = pool(&[(true, 2), (true, 0), (true, 5)]);
        let chosen = LeastConnectionsBalancer::default().select_backend(&pool).unwrap();
        assert_eq!(index_of(&pool, &chosen), 1);
    }

    #[test]
    fn skips_unhealthy_even_when_idle() {
        let pool = pool(&[(false, 0), (true, 3)]);
        let chosen = LeastConnectionsBalancer::default().select_backend(&pool).unwrap();
        assert_eq!(index_of(&pool, &chosen), 1);
        assert!(chosen.is_healthy());
    }

    #[test]
    fn rejects_when_nothing_is_healthy() {
        let pool = pool(&[(false, 0), (false, 0)]);
        let result = LeastConnectionsBalancer::new(NoHealthyPolicy::Reject).select_backend(&pool);
        assert_eq!(result.unwrap_err(), SelectionError::NoHealthyBackend);
    }

    #[test]
    fn least_loaded_policy_ignores_health_as_last_resort() {
        let pool = pool(&[(false, 4), (false, 1), (false, 1)]);
        let chosen = LeastConnectionsBalancer::new(NoHealthyPolicy::LeastLoaded)
            .select_backend(&pool)
            .unwrap();
        assert_eq!(index_of(&pool, &chosen), 1);
    }

    #[test]
    fn least_loaded_policy_still_prefers_healthy() {
        let pool = pool(&[(false, 0), (true, 9)]);
        let chosen = LeastConnectionsBalancer::new(NoHealthyPolicy::LeastLoaded)
            .select_backend(&pool)
            .unwrap();
        assert_eq!(index_of(&pool, &chosen), 1);
    }

    #[test]
    fn ties_go_to_first_in_pool_order() {
        let pool = pool(&[(false, 0), (true, 3), (true, 1), (true, 1)]);
        let balancer = LeastConnectionsBalancer::default();

        for _ in 0..10 {
            let chosen = balancer.select_backend(&pool).unwrap();
            assert_eq!(index_of(&pool, &chosen), 2);
        }
    }

    #[test]
    fn selection_leaves_counts_untouched() {
        let pool = pool(&[(true, 2), (true, 0)]);
        LeastConnectionsBalancer::default().select_backend(&pool).unwrap();

        let counts: Vec<_> = pool.snapshot().iter().map(|(_, s)| s.active_connections).collect();
        assert_eq!(counts, [2, 0]);
    }

    #[test]
    fn chosen_is_minimal_among_healthy() {
        let entries = [(true, 7), (false, 0), (true, 3), (true, 4), (false, 1), (true, 3)];
        let pool = pool(&entries);
        let chosen = LeastConnectionsBalancer::default().select_backend(&pool).unwrap();

        let chosen_load = chosen.active_connections();
        for backend in pool.backends().iter().filter(|b| b.is_healthy()) {
            assert!(chosen_load <= backend.active_connections());
        }
        assert_eq!(index_of(&pool, &chosen), 2);
    }

    fn arb_pool() -> impl Strategy<Value = Vec<(bool, usize)>> {
        prop::collection::vec((any::<bool>(), 0usize..6), 1..12)
    }

    fn first_min(entries: &[(bool, usize)], eligible: impl Fn(bool) -> bool) -> Option<usize> {
        entries
            .iter()
            .enumerate()
            .filter(|(_, (healthy, _))| eligible(*healthy))
            .min_by_key(|(index, (_, active))| (*active, *index))
            .map(|(index, _)| index)
    }

    proptest! {
        #[test]
        fn healthy_selection_is_first_minimal_healthy(entries in arb_pool()) {
            prop_assume!(entries.iter().any(|(healthy, _)| *healthy));
            let pool = pool(&entries);

            for policy in [NoHealthyPolicy::Reject, NoHealthyPolicy::LeastLoaded] {
                let chosen = LeastConnectionsBalancer::new(policy).select_backend(&pool).unwrap();
                let index = index_of(&pool, &chosen);

                prop_assert!(entries[index].0);
                for (healthy, active) in &entries {
                    if *healthy {
                        prop_assert!(entries[index].1 <= *active);
                    }
                }
                prop_assert_eq!(Some(index), first_min(&entries, |healthy| healthy));
            }
        }

        #[test]
        fn all_unhealthy_follows_policy(loads in prop::collection::vec(0usize..6, 1..12)) {
            let entries: Vec<_> = loads.iter().map(|&active| (false, active)).collect();
            let pool = pool(&entries);

            let rejected = LeastConnectionsBalancer::new(NoHealthyPolicy::Reject).select_backend(&pool);
            prop_assert_eq!(rejected.unwrap_err(), SelectionError::NoHealthyBackend);

            let chosen = LeastConnectionsBalancer::new(NoHealthyPolicy::LeastLoaded)
                .select_backend(&pool)
                .unwrap();
            prop_assert_eq!(Some(index_of(&pool, &chosen)), first_min(&entries, |_| true));
        }

        #[test]
        fn repeated_selection_is_stable(entries in arb_pool()) {
            let pool = pool(&entries);
            let balancer = LeastConnectionsBalancer::new(NoHealthyPolicy::LeastLoaded);

            let first = index_of(&pool, &balancer.select_backend(&pool).unwrap());
            for _ in 0..5 {
                let again = index_of(&pool, &balancer.select_backend(&pool).unwrap());
                prop_assert_eq!(first, again);
            }
        }
    }
}
