//! The Service Registry: the facade that composes the store, transports,
//! health checker, and load balancer into the operations callers actually
//! invoke (`registerTemplate`, `createInstance`, `selectInstance`, ...).

use std::sync::Arc;

use dashmap::DashMap;

use crate::balancer::{BalancerStrategy, LoadBalancer};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{GlobalHealthStats, HealthChecker, PerServiceHealthStats, Probe};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::model::{HealthStatus, Instance, InstanceState, LoadBalancerMetrics, Metadata, Template, Transport as TransportKind};
use crate::store::{InstancePatch, ObservationStore};
use crate::transport::container::{requires_container, ContainerAdapter, DEFAULT_RUNTIME};
use crate::transport::http::HttpAdapter;
use crate::transport::stdio::StdioAdapter;
use crate::transport::{AdapterEvent, TransportAdapter};

/// Overrides accepted by `createInstance`, layered on top of the copied
/// template. `managed` instances are not auto-enrolled into monitoring —
/// some outer orchestrator owns their lifecycle and health instead.
#[derive(Debug, Clone, Default)]
pub struct InstanceOverrides {
    pub metadata: Option<Metadata>,
    pub managed: bool,
}

pub struct HealthAggregates {
    pub global: GlobalHealthStats,
    pub per_service: Vec<(String, PerServiceHealthStats)>,
}

struct Inner {
    store: ObservationStore,
    config: GatewayConfig,
    health_checker: Arc<HealthChecker>,
    balancer: LoadBalancer,
    adapters: DashMap<String, Arc<dyn TransportAdapter>>,
}

/// Cheap to clone; every clone shares the same underlying store, adapters,
/// and checker.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
}

impl ServiceRegistry {
    pub fn new(
        store: ObservationStore,
        config: GatewayConfig,
        health_checker: Arc<HealthChecker>,
    ) -> Self {
        let balancer = LoadBalancer::new(config.load_balancing_strategy);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                health_checker,
                balancer,
                adapters: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &ObservationStore {
        &self.inner.store
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.inner.health_checker
    }

    /// Validates `template`; on success, atomically upserts and emits
    /// `template:set`. An invalid template fails with `BadInput` and emits
    /// no event (`set_template` validates before staging).
    pub fn register_template(&self, template: Template) -> GatewayResult<()> {
        self.inner.store.set_template(template)
    }

    /// Watches one instance's transport for an unannounced disconnect and
    /// folds it into the store: state flips to `crashed` and `errorCount`
    /// goes up by one. Exits quietly once it has seen a `Disconnect` — an
    /// adapter emits exactly one over its lifetime, whether the instance
    /// crashed on its own or was asked to stop via `removeInstance`; in the
    /// latter case the instance row is usually already gone by the time
    /// this runs, so the patch below is a harmless no-op.
    fn spawn_crash_watcher(&self, instance_id: String, mut events: tokio::sync::broadcast::Receiver<AdapterEvent>) {
        let store = self.inner.store.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let AdapterEvent::Disconnect { code, signal } = event {
                    let error_count = store.get_instance(&instance_id).map(|i| i.error_count + 1).unwrap_or(1);
                    let _ = store.patch_instance(
                        &instance_id,
                        InstancePatch {
                            state: Some(InstanceState::Crashed),
                            pid: Some(None),
                            error_count: Some(error_count),
                            ..Default::default()
                        },
                    );
                    tracing::warn!(instance = %instance_id, ?code, ?signal, "instance disconnected");
                    break;
                }
            }
        });
    }

    fn build_adapter(&self, template: &Template) -> GatewayResult<Arc<dyn TransportAdapter>> {
        let locked_down = self.inner.config.sandbox.profile == crate::config::SandboxProfile::LockedDown;
        let force_container = requires_container(template, locked_down)
            || (template.untrusted && self.inner.config.sandbox.container.required_for_untrusted);

        if force_container {
            return Ok(Arc::new(ContainerAdapter::new(DEFAULT_RUNTIME)));
        }

        match template.transport {
            TransportKind::Stdio => Ok(Arc::new(StdioAdapter::new())),
            TransportKind::Http | TransportKind::StreamableHttp => Ok(Arc::new(HttpAdapter::new())),
        }
    }

    /// Copies `templateName`'s template, applies `overrides`, assigns an
    /// id, and atomically sets the instance plus a zero metrics row —
    /// `createInstance` never leaves the store in a partial state. Starts
    /// monitoring unless the override marks the instance as managed.
    pub async fn create_instance(
        &self,
        template_name: &str,
        overrides: Option<InstanceOverrides>,
    ) -> GatewayResult<Instance> {
        let template = self
            .inner
            .store
            .get_template(template_name)
            .ok_or_else(|| GatewayError::NotFound(format!("no template named {template_name:?}")))?;

        if self.inner.store.list_instances(None).len() >= self.inner.config.max_concurrent_services {
            return Err(GatewayError::PolicyViolation(format!(
                "max concurrent services ({}) reached",
                self.inner.config.max_concurrent_services
            )));
        }

        let overrides = overrides.unwrap_or_default();
        let mut instance = Instance::new(&template);
        if let Some(metadata) = overrides.metadata {
            instance.metadata = metadata;
        }
        instance.managed = overrides.managed;

        let adapter = self.build_adapter(&template)?;
        adapter.connect(&template).await?;
        instance.state = InstanceState::Running;
        instance.pid = adapter.pid();

        let id = instance.id.clone();
        let adapter_events = adapter.subscribe();
        self.inner.adapters.insert(id.clone(), adapter);
        self.spawn_crash_watcher(id.clone(), adapter_events);

        self.inner.store.atomic_update(|tx| {
            tx.set_instance(instance.clone())?;
            tx.update_metrics(id.clone(), LoadBalancerMetrics::zero(id.clone()))?;
            Ok(())
        })?;

        if !overrides.managed {
            // Probe-not-configured is not a failure: the instance stays
            // registered and `idle` remains reachable via a later retry of
            // `setHealthProbe` + `startHealthMonitoring`.
            if self.inner.health_checker.has_probe() {
                let _ = self.inner.health_checker.check_health(&id, true, None).await;
            }
        }

        Ok(instance)
    }

    /// Disconnects the instance's transport, then cascades the store
    /// removal (instance, then health, then metrics). Idempotent: removing
    /// an id that's already gone is not an error.
    pub async fn remove_instance(&self, id: &str) -> GatewayResult<()> {
        if let Some((_, adapter)) = self.inner.adapters.remove(id) {
            adapter.disconnect().await?;
        }
        self.inner.store.remove_instance(id)
    }

    pub fn list_services(&self) -> Vec<Instance> {
        self.inner.store.list_instances(None)
    }

    pub fn get_service(&self, id: &str) -> Option<Instance> {
        self.inner.store.get_instance(id)
    }

    /// Filters candidates to healthy ones (falling back to the full pool if
    /// none are healthy), then delegates to the balancer. `None` if the
    /// template has no instances at all.
    pub fn select_instance(&self, template_name: &str, strategy: Option<BalancerStrategy>) -> Option<Instance> {
        let candidates = self.inner.store.list_instances(Some(template_name));
        if candidates.is_empty() {
            return None;
        }

        let health: DashMap<String, HealthStatus> = DashMap::new();
        let metrics: DashMap<String, LoadBalancerMetrics> = DashMap::new();
        for instance in &candidates {
            if let Some(status) = self.inner.store.get_health(&instance.id) {
                health.insert(instance.id.clone(), status);
            }
            if let Some(m) = self.inner.store.get_metrics(&instance.id) {
                metrics.insert(instance.id.clone(), m);
            }
        }

        match strategy {
            Some(strategy) if strategy != self.inner.balancer.strategy() => {
                LoadBalancer::new(strategy).select(template_name, &candidates, &health, &metrics)
            }
            _ => self.inner.balancer.select(template_name, &candidates, &health, &metrics),
        }
    }

    /// Converges the instance count for `template_name` toward `n`,
    /// creating or removing instances as needed, and returns the survivor
    /// set in insertion order.
    pub async fn scale_template(&self, template_name: &str, n: usize) -> GatewayResult<Vec<Instance>> {
        let mut current = self.inner.store.list_instances(Some(template_name));

        while current.len() < n {
            let created = self.create_instance(template_name, None).await?;
            current.push(created);
        }

        while current.len() > n {
            if let Some(victim) = current.pop() {
                self.remove_instance(&victim.id).await?;
            }
        }

        Ok(self.inner.store.list_instances(Some(template_name)))
    }

    pub fn get_health_aggregates(&self) -> HealthAggregates {
        let instances = self.inner.store.list_instances(None);
        let statuses: Vec<(String, HealthStatus)> = instances
            .iter()
            .filter_map(|i| self.inner.store.get_health(&i.id).map(|h| (i.id.clone(), h)))
            .collect();
        let global = self.inner.health_checker.global_stats(&statuses);
        let per_service = instances
            .iter()
            .filter_map(|i| {
                self.inner
                    .health_checker
                    .per_service_stats(&i.id)
                    .map(|stats| (i.id.clone(), stats))
            })
            .collect();
        HealthAggregates { global, per_service }
    }

    /// Wires (or replaces) the active health probe.
    pub fn set_health_probe(&self, probe: Probe) {
        self.inner.health_checker.set_probe(probe);
    }

    /// Feeds the sweep every instance id except `managed` ones, whose
    /// health an outer orchestrator owns instead.
    pub fn start_health_monitoring(&self) {
        let store = self.inner.store.clone();
        self.inner.health_checker.start_monitoring(move || {
            store
                .list_instances(None)
                .into_iter()
                .filter(|i| !i.managed)
                .map(|i| i.id)
                .collect()
        });
    }

    pub fn stop_health_monitoring(&self) {
        self.inner.health_checker.stop_monitoring();
    }

    /// Resolves `service_id` to its adapter and delegates to
    /// `send_and_receive`. `NotFound` if the id names no connected
    /// instance — this is the core's half of the HTTP façade's proxy
    /// endpoint.
    pub async fn send_message(&self, service_id: &str, request: JsonRpcRequest) -> GatewayResult<JsonRpcResponse> {
        let adapter = self
            .inner
            .adapters
            .get(service_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("no connected service named {service_id:?}")))?;

        let timeout_ms = self
            .inner
            .store
            .get_instance(service_id)
            .map(|i| i.template.timeout_ms)
            .unwrap_or(self.inner.config.request_timeout);

        adapter.send_and_receive(request, timeout_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckerConfig;
    use crate::model::{ProtocolVersion, Transport};
    use std::collections::HashMap;

    fn template(name: &str, transport: Transport) -> Template {
        Template {
            name: name.to_string(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport,
            command: if transport == Transport::Stdio {
                Some("sh".into())
            } else {
                None
            },
            args: vec![],
            env: HashMap::new(),
            working_directory: None,
            endpoint: if transport == Transport::Stdio {
                None
            } else {
                Some("http://127.0.0.1:1/does-not-matter".into())
            },
            timeout_ms: 1000,
            retries: 0,
            container: None,
            health_check: None,
            untrusted: false,
        }
    }

    fn registry() -> ServiceRegistry {
        let store = ObservationStore::new();
        let checker = HealthChecker::new(store.clone(), HealthCheckerConfig::default());
        ServiceRegistry::new(store, GatewayConfig::default(), checker)
    }

    #[tokio::test]
    async fn register_invalid_template_is_bad_input_with_no_event() {
        let registry = registry();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let events2 = events.clone();
        registry.store().subscribe(move |e| events2.lock().push(e.name()));

        let bad = Template {
            name: "".into(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport: Transport::Stdio,
            command: None,
            args: vec![],
            env: HashMap::new(),
            working_directory: None,
            endpoint: None,
            timeout_ms: 1000,
            retries: 0,
            container: None,
            health_check: None,
            untrusted: false,
        };
        let result = registry.register_template(bad);
        assert!(matches!(result, Err(GatewayError::BadInput(_))));
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn select_instance_returns_none_for_unknown_template() {
        let registry = registry();
        assert!(registry.select_instance("missing", None).is_none());
    }

    #[tokio::test]
    async fn remove_instance_is_idempotent() {
        let registry = registry();
        registry.remove_instance("never-existed").await.unwrap();
    }

    fn echo_template(name: &str) -> Template {
        let script = r#"
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  method=$(echo "$line" | sed -n 's/.*"method":"\([a-zA-Z/]*\)".*/\1/p')
  if [ "$method" = "initialize" ]; then
    echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-06-18\"}}"
  elif [ -n "$id" ]; then
    echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"ok\":true}}"
  fi
done
"#;
        Template {
            name: name.to_string(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport: Transport::Stdio,
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            working_directory: None,
            endpoint: None,
            timeout_ms: 2000,
            retries: 0,
            container: None,
            health_check: None,
            untrusted: false,
        }
    }

    #[tokio::test]
    async fn managed_override_persists_on_the_instance_and_is_excluded_from_sweep_ids() {
        let registry = registry();
        registry.register_template(echo_template("svc")).unwrap();

        let plain = registry.create_instance("svc", None).await.unwrap();
        let managed = registry
            .create_instance(
                "svc",
                Some(InstanceOverrides {
                    managed: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        assert!(!registry.get_service(&plain.id).unwrap().managed);
        assert!(registry.get_service(&managed.id).unwrap().managed);

        let swept_ids: Vec<String> = registry
            .store()
            .list_instances(None)
            .into_iter()
            .filter(|i| !i.managed)
            .map(|i| i.id)
            .collect();
        assert!(swept_ids.contains(&plain.id));
        assert!(!swept_ids.contains(&managed.id));
    }
}
