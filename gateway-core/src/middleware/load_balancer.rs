//! `LoadBalancerMiddleware`: consumes the health view published by
//! [`super::health_check::HealthCheckMiddleware`], selects an instance, and
//! records the outcome of the call once it completes.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::balancer::LoadBalancer;
use crate::error::GatewayError;
use crate::model::{HealthStatus, Instance, LoadBalancerMetrics};
use crate::store::ObservationStore;

use super::{Context, MiddlewareHook, PipelineState};

pub struct LoadBalancerMiddleware {
    store: ObservationStore,
    balancer: LoadBalancer,
}

impl LoadBalancerMiddleware {
    pub fn new(store: ObservationStore, balancer: LoadBalancer) -> Self {
        Self { store, balancer }
    }
}

#[async_trait]
impl MiddlewareHook for LoadBalancerMiddleware {
    async fn before_model(&self, _ctx: &Context, state: &mut PipelineState) -> Result<(), GatewayError> {
        let template_name = state
            .values
            .get("templateName")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::BadInput("missing templateName in pipeline state".into()))?;

        let candidates = self.store.list_instances(Some(&template_name));

        let health: DashMap<String, HealthStatus> = DashMap::new();
        if let Some(view) = state.values.get("healthView") {
            if let Ok(parsed) = serde_json::from_value::<std::collections::HashMap<String, HealthStatus>>(view.clone()) {
                for (id, status) in parsed {
                    health.insert(id, status);
                }
            }
        }

        let metrics: DashMap<String, LoadBalancerMetrics> = DashMap::new();
        for candidate in &candidates {
            if let Some(m) = self.store.get_metrics(&candidate.id) {
                metrics.insert(candidate.id.clone(), m);
            }
        }

        let selected: Option<Instance> = self.balancer.select(&template_name, &candidates, &health, &metrics);

        match &selected {
            Some(instance) => {
                state
                    .values
                    .insert("selectedInstanceId".to_string(), serde_json::json!(instance.id));
                state
                    .values
                    .insert("selectedInstance".to_string(), serde_json::to_value(instance).unwrap_or_default());
                state.values.insert(
                    "callStartTime".to_string(),
                    serde_json::json!(crate::model::now_ms()),
                );
            }
            None => {
                state.values.insert("selectedInstanceId".to_string(), serde_json::Value::Null);
            }
        }

        Ok(())
    }

    async fn after_tool(&self, _ctx: &Context, state: &mut PipelineState) -> Result<(), GatewayError> {
        let Some(instance_id) = state.values.get("selectedInstanceId").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(start) = state.values.get("callStartTime").and_then(|v| v.as_u64()) else {
            return Ok(());
        };
        let end = crate::model::now_ms();
        if end < start {
            return Ok(());
        }

        let success = !state.aborted;
        let latency_ms = end - start;
        let mut metrics = self
            .store
            .get_metrics(instance_id)
            .unwrap_or_else(|| LoadBalancerMetrics::zero(instance_id.to_string()));
        metrics.record(latency_ms, success);
        self.store.update_metrics(instance_id, metrics)?;
        Ok(())
    }
}
