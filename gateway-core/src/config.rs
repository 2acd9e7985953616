//! Gateway-wide configuration, loaded from TOML with sensible defaults for
//! every knob.

use serde::{Deserialize, Serialize};

use crate::balancer::BalancerStrategy;
use crate::error::{GatewayError, GatewayResult};

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent_services() -> usize {
    50
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxProfile {
    Default,
    LockedDown,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        SandboxProfile::Default
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSandboxConfig {
    #[serde(default)]
    pub required_for_untrusted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub profile: SandboxProfile,
    #[serde(default)]
    pub container: ContainerSandboxConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            profile: SandboxProfile::default(),
            container: ContainerSandboxConfig::default(),
        }
    }
}

/// Every tunable in one place, loaded from `gateway.toml` (or whatever path
/// the caller points at) with `Default` filling in anything omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_concurrent_services")]
    pub max_concurrent_services: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout: u64,
    #[serde(default)]
    pub load_balancing_strategy: BalancerStrategy,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval_ms(),
            max_concurrent_services: default_max_concurrent_services(),
            request_timeout: default_request_timeout_ms(),
            load_balancing_strategy: BalancerStrategy::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(text: &str) -> GatewayResult<Self> {
        toml::from_str(text).map_err(|err| GatewayError::BadInput(format!("invalid config: {err}")))
    }

    pub async fn load(path: &std::path::Path) -> GatewayResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configured_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.health_check_interval, 30_000);
        assert_eq!(config.max_concurrent_services, 50);
        assert_eq!(config.request_timeout, 30_000);
        assert_eq!(config.load_balancing_strategy, BalancerStrategy::PerformanceBased);
        assert_eq!(config.sandbox.profile, SandboxProfile::Default);
        assert!(!config.sandbox.container.required_for_untrusted);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            maxConcurrentServices = 10

            [sandbox]
            profile = "locked-down"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_services, 10);
        assert_eq!(config.health_check_interval, 30_000);
        assert_eq!(config.sandbox.profile, SandboxProfile::LockedDown);
    }

    #[test]
    fn malformed_toml_is_bad_input() {
        let result = GatewayConfig::from_toml_str("not = [valid");
        assert!(matches!(result, Err(GatewayError::BadInput(_))));
    }
}
