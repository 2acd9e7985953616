//! Global and per-service health aggregates, as returned by
//! `ServiceRegistry::get_health_aggregates`.

use serde::Serialize;

use crate::model::HealthStatus;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalHealthStats {
    pub monitoring: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub mean_latency_ms: f64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerServiceHealthStats {
    pub last_status: HealthStatus,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
    pub latest_error: Option<String>,
    pub latest_latencies: Vec<u64>,
}

pub fn global_stats(statuses: &[(String, HealthStatus)], histories: &[&latency::LatencyHistory]) -> GlobalHealthStats {
    let healthy = statuses.iter().filter(|(_, s)| s.healthy).count();
    let unhealthy = statuses.len() - healthy;
    let agg = latency::global_stats(histories.iter().copied());

    GlobalHealthStats {
        monitoring: statuses.len(),
        healthy,
        unhealthy,
        mean_latency_ms: agg.mean_ms,
        p95_ms: agg.p95_ms,
        p99_ms: agg.p99_ms,
        error_rate: if statuses.is_empty() {
            0.0
        } else {
            unhealthy as f64 / statuses.len() as f64
        },
    }
}

pub fn per_service_stats(
    status: HealthStatus,
    history: Option<&latency::LatencyHistory>,
    error_rate: f64,
) -> PerServiceHealthStats {
    let (p95_ms, p99_ms, latest_latencies) = match history {
        Some(h) => (h.p95(), h.p99(), h.recent(30)),
        None => (0, 0, Vec::new()),
    };
    let latest_error = status.error.clone();
    PerServiceHealthStats {
        error_rate,
        last_status: status,
        p95_ms,
        p99_ms,
        latest_error,
        latest_latencies,
    }
}
