//! The load balancer: picks one instance per call from a list of
//! candidates, using a pluggable strategy.

mod strategy;

pub use strategy::{BalancerStrategy, PerformanceCoefficients};

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{HealthStatus, Instance, LoadBalancerMetrics};

/// Scheduling state the balancer owns privately — not observable data, so
/// it is never routed through the store.
pub struct LoadBalancer {
    strategy: BalancerStrategy,
    coefficients: PerformanceCoefficients,
    round_robin_cursors: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self {
            strategy,
            coefficients: PerformanceCoefficients::default(),
            round_robin_cursors: DashMap::new(),
        }
    }

    pub fn with_coefficients(mut self, coefficients: PerformanceCoefficients) -> Self {
        self.coefficients = coefficients;
        self
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Select one instance for `template_name` out of `candidates`, given
    /// each candidate's current health and metrics (by instance id).
    /// `None` input or an empty candidate list yields `None` without
    /// consulting anything else.
    pub fn select(
        &self,
        template_name: &str,
        candidates: &[Instance],
        health: &dashmap::DashMap<String, HealthStatus>,
        metrics: &dashmap::DashMap<String, LoadBalancerMetrics>,
    ) -> Option<Instance> {
        if candidates.is_empty() {
            return None;
        }

        let healthy: Vec<&Instance> = candidates
            .iter()
            .filter(|i| health.get(&i.id).map(|h| h.healthy).unwrap_or(false))
            .collect();

        // Round-robin still picks from the full list when everything is
        // unhealthy (graceful degradation); other strategies naturally
        // fall back to the unfiltered list for the same reason.
        let pool: Vec<&Instance> = if healthy.is_empty() {
            tracing::warn!(
                template = template_name,
                candidates = candidates.len(),
                "no healthy candidates, degrading to the full pool"
            );
            candidates.iter().collect()
        } else {
            healthy
        };

        match self.strategy {
            BalancerStrategy::RoundRobin => self.select_round_robin(template_name, &pool),
            BalancerStrategy::LeastConnections => self.select_least_conn(&pool, metrics),
            BalancerStrategy::Weighted => self.select_weighted(&pool),
            BalancerStrategy::PerformanceBased => {
                self.select_performance_based(&pool, health, metrics)
            }
        }
        .cloned()
    }

    fn select_round_robin<'a>(&self, template_name: &str, pool: &[&'a Instance]) -> Option<&'a Instance> {
        if pool.is_empty() {
            return None;
        }
        let cursor = self
            .round_robin_cursors
            .entry(template_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::SeqCst) % pool.len();
        Some(pool[idx])
    }

    fn select_least_conn<'a>(
        &self,
        pool: &[&'a Instance],
        metrics: &dashmap::DashMap<String, LoadBalancerMetrics>,
    ) -> Option<&'a Instance> {
        pool.iter()
            .copied()
            .min_by(|a, b| {
                let ra = metrics.get(&a.id).map(|m| m.request_count).unwrap_or(0);
                let rb = metrics.get(&b.id).map(|m| m.request_count).unwrap_or(0);
                ra.cmp(&rb).then_with(|| a.id.cmp(&b.id))
            })
    }

    fn select_weighted<'a>(&self, pool: &[&'a Instance]) -> Option<&'a Instance> {
        if pool.is_empty() {
            return None;
        }
        let weights: Vec<f64> = pool.iter().map(|i| i.weight().max(0.0)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return pool.first().copied();
        }
        let mut draw = rand::random::<f64>() * total;
        for (instance, weight) in pool.iter().zip(weights.iter()) {
            draw -= weight;
            if draw <= 0.0 {
                return Some(instance);
            }
        }
        pool.last().copied()
    }

    fn select_performance_based<'a>(
        &self,
        pool: &[&'a Instance],
        health: &dashmap::DashMap<String, HealthStatus>,
        metrics: &dashmap::DashMap<String, LoadBalancerMetrics>,
    ) -> Option<&'a Instance> {
        let max_latency = pool
            .iter()
            .filter_map(|i| metrics.get(&i.id).map(|m| m.avg_response_time))
            .fold(0.0_f64, f64::max)
            .max(1.0);

        pool.iter()
            .copied()
            .map(|instance| {
                let m = metrics.get(&instance.id);
                let avg_response_time = m.as_ref().map(|m| m.avg_response_time).unwrap_or(0.0);
                let error_rate = m.as_ref().map(|m| m.error_rate()).unwrap_or(0.0);
                let healthy_bit = health.get(&instance.id).map(|h| h.healthy).unwrap_or(false) as u8 as f64;
                let score = self.coefficients.latency * (1.0 - avg_response_time / max_latency)
                    + self.coefficients.error * (1.0 - error_rate)
                    + self.coefficients.health * healthy_bit;
                (instance, score)
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(instance, _)| instance)
    }
}
