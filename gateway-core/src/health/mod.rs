//! The health checker: active probes, passive heartbeats, a coalescing
//! cache so concurrent callers share one in-flight probe, and a
//! concurrency-bounded periodic sweep.
//!
//! Coalescing uses `moka::future::Cache`'s single-flight `get_with`
//! semantics. Sweep concurrency is bounded by a `tokio::sync::Semaphore`,
//! the same gated concurrent-check shape used by semaphore-based health
//! checkers elsewhere in the ecosystem.

mod stats;

pub use stats::{GlobalHealthStats, PerServiceHealthStats};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use tokio::sync::Semaphore;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{now_ms, HealthStatus};
use crate::store::ObservationStore;

pub type ProbeFuture = Pin<Box<dyn Future<Output = GatewayResult<HealthStatus>> + Send>>;
pub type Probe = Arc<dyn Fn(String) -> ProbeFuture + Send + Sync>;

/// Running success/failure tally behind an instance's `errorRate`.
#[derive(Default)]
struct Outcomes {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Outcomes {
    fn record(&self, healthy: bool) {
        if healthy {
            self.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn error_rate(&self) -> f64 {
        let successes = self.successes.load(Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);
        let total = successes + failures;
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }
}

const DEFAULT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MAX_AGE_MS: u64 = 5_000;
const DEFAULT_SWEEP_CONCURRENCY: usize = 8;

pub struct HealthCheckerConfig {
    pub interval_ms: u64,
    pub default_max_age_ms: u64,
    pub sweep_concurrency: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            default_max_age_ms: DEFAULT_MAX_AGE_MS,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

pub struct HealthChecker {
    store: ObservationStore,
    config: HealthCheckerConfig,
    probe: parking_lot::RwLock<Option<Probe>>,
    /// Coalescing cache: concurrent `checkHealth(id)` calls for the same id
    /// share one in-flight probe rather than invoking the dependency twice.
    inflight: Cache<String, HealthStatus>,
    histories: DashMap<String, latency::LatencyHistory>,
    outcomes: DashMap<String, Outcomes>,
    sweeping: AtomicBool,
    sweep_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(store: ObservationStore, config: HealthCheckerConfig) -> Arc<Self> {
        let inflight = Cache::builder()
            .time_to_live(Duration::from_millis(config.default_max_age_ms.max(1)))
            .build();
        Arc::new(Self {
            store,
            config,
            probe: parking_lot::RwLock::new(None),
            inflight,
            histories: DashMap::new(),
            outcomes: DashMap::new(),
            sweeping: AtomicBool::new(false),
            sweep_task: parking_lot::Mutex::new(None),
        })
    }

    /// Wire (or replace) the active probe function.
    pub fn set_probe(&self, probe: Probe) {
        *self.probe.write() = Some(probe);
    }

    pub fn has_probe(&self) -> bool {
        self.probe.read().is_some()
    }

    /// Passive ingestion path: record a status a caller already measured,
    /// without triggering any I/O.
    pub fn record_heartbeat(&self, instance_id: &str, status: HealthStatus) -> GatewayResult<()> {
        self.record_sample(instance_id, &status);
        self.store.update_health(instance_id, status)
    }

    /// `checkHealth`: returns a cached status younger than `max_age_ms`
    /// unless `force`, otherwise invokes (or coalesces onto) the probe.
    pub async fn check_health(
        &self,
        instance_id: &str,
        force: bool,
        max_age_ms: Option<u64>,
    ) -> GatewayResult<HealthStatus> {
        let max_age = max_age_ms.unwrap_or(self.config.default_max_age_ms);

        if !force {
            if let Some(cached) = self.store.get_health(instance_id) {
                if cached.age_ms(now_ms()) < max_age {
                    return Ok(cached);
                }
            }
        }

        let probe = self
            .probe
            .read()
            .clone()
            .ok_or_else(|| GatewayError::NotReady("health probe not configured".into()))?;

        let id = instance_id.to_string();
        if force {
            // `get_with` would otherwise hand back a still-TTL-valid cached
            // entry even though the caller asked to bypass it.
            self.inflight.invalidate(&id).await;
        }
        // A probe that throws maps to an unhealthy status rather than a
        // cache error, so `get_with` (infallible) is the right primitive:
        // there is never an error variant for the cache itself to carry.
        let result = self
            .inflight
            .get_with(id.clone(), {
                let probe = probe.clone();
                let id = id.clone();
                async move {
                    match probe(id).await {
                        Ok(status) => status,
                        Err(err) => HealthStatus::unhealthy(err.to_string()),
                    }
                }
            })
            .await;

        self.record_sample(instance_id, &result);
        self.store.update_health(instance_id, result.clone())?;
        Ok(result)
    }

    fn record_sample(&self, instance_id: &str, status: &HealthStatus) {
        if let Some(latency_ms) = status.latency_ms {
            self.histories
                .entry(instance_id.to_string())
                .or_insert_with(latency::LatencyHistory::new)
                .record(latency_ms);
        }
        self.outcomes
            .entry(instance_id.to_string())
            .or_default()
            .record(status.healthy);
    }

    /// One pass over every monitored id, bounded to `sweep_concurrency`
    /// concurrent probes. A sweep already running is skipped, never
    /// stacked — the next sweep starts only once the current one finishes.
    pub async fn sweep(self: &Arc<Self>, instance_ids: Vec<String>) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sweep already in progress, skipping");
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.sweep_concurrency));
        let mut handles = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            let semaphore = semaphore.clone();
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else { return };
                if let Err(err) = this.check_health(&id, true, None).await {
                    tracing::warn!(instance = %id, %err, "sweep probe failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.sweeping.store(false, Ordering::SeqCst);
    }

    /// Start the periodic sweep loop against the given id supplier. Calling
    /// this twice replaces the previous loop.
    pub fn start_monitoring<F>(self: &Arc<Self>, ids_fn: F)
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        self.stop_monitoring();
        let this = self.clone();
        let interval_ms = self.config.interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                this.sweep(ids_fn()).await;
            }
        });
        *self.sweep_task.lock() = Some(handle);
    }

    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
    }

    pub fn global_stats(&self, statuses: &[(String, HealthStatus)]) -> GlobalHealthStats {
        // Collect references while the DashMap shard guards are held, then
        // hand them to the plain aggregation function; no latency data is
        // ever copied out of its history.
        let guards: Vec<_> = self.histories.iter().collect();
        let histories: Vec<&latency::LatencyHistory> = guards.iter().map(|g| g.value()).collect();
        stats::global_stats(statuses, &histories)
    }

    pub fn per_service_stats(&self, instance_id: &str) -> Option<PerServiceHealthStats> {
        let status = self.store.get_health(instance_id)?;
        let history = self.histories.get(instance_id);
        let error_rate = self.outcomes.get(instance_id).map(|o| o.error_rate()).unwrap_or(0.0);
        Some(stats::per_service_stats(status, history.as_deref(), error_rate))
    }
}
