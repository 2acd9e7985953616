//! `HealthCheckMiddleware`: refreshes stale health entries for the
//! candidate instances of a request and publishes the resulting view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::GatewayError;
use crate::health::HealthChecker;
use crate::model::{HealthStatus, Instance};
use crate::store::ObservationStore;

use super::{Context, MiddlewareHook, PipelineState};

pub const HEALTH_PROBE_CTX_KEY: &str = "health_probe";
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_TTL_MS: u64 = 5_000;

pub struct HealthCheckMiddleware {
    store: ObservationStore,
    checker: Arc<HealthChecker>,
    ttl_ms: u64,
    concurrency: usize,
}

impl HealthCheckMiddleware {
    pub fn new(store: ObservationStore, checker: Arc<HealthChecker>) -> Self {
        Self {
            store,
            checker,
            ttl_ms: DEFAULT_TTL_MS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }
}

#[async_trait]
impl MiddlewareHook for HealthCheckMiddleware {
    async fn before_model(&self, _ctx: &Context, state: &mut PipelineState) -> Result<(), GatewayError> {
        let instances: Vec<Instance> = match state.values.get("instances") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_default(),
            None => {
                let template_name = state
                    .values
                    .get("templateName")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match template_name {
                    Some(name) => self.store.list_instances(Some(&name)),
                    None => self.store.list_instances(None),
                }
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(instances.len());
        for instance in &instances {
            let stale = self
                .store
                .get_health(&instance.id)
                .map(|h| h.age_ms(crate::model::now_ms()) >= self.ttl_ms)
                .unwrap_or(true);
            if !stale {
                continue;
            }
            let checker = self.checker.clone();
            let semaphore = semaphore.clone();
            let id = instance.id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let _ = checker.check_health(&id, false, None).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut view: HashMap<String, HealthStatus> = HashMap::new();
        for instance in &instances {
            if let Some(status) = self.store.get_health(&instance.id) {
                view.insert(instance.id.clone(), status);
            }
        }

        state
            .values
            .insert("healthView".to_string(), serde_json::to_value(&view).unwrap_or_default());
        Ok(())
    }
}
