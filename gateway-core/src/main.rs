//! Binary entry point: wires the observation store, health checker, load
//! balancer, and service registry together and starts periodic health
//! monitoring.

use std::path::PathBuf;

use gateway_core::config::GatewayConfig;
use gateway_core::health::{HealthChecker, HealthCheckerConfig};
use gateway_core::registry::ServiceRegistry;
use gateway_core::store::ObservationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("gateway.toml"));

    let config = match GatewayConfig::load(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), %err, "no usable config file, falling back to defaults");
            GatewayConfig::default()
        }
    };

    let store = ObservationStore::new();
    let health_checker = HealthChecker::new(
        store.clone(),
        HealthCheckerConfig {
            interval_ms: config.health_check_interval,
            ..HealthCheckerConfig::default()
        },
    );

    let registry = ServiceRegistry::new(store, config, health_checker);
    registry.start_health_monitoring();

    tracing::info!("gateway started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    registry.stop_health_monitoring();

    Ok(())
}
