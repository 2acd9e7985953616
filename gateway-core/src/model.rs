//! The data model: Template, Instance, HealthStatus, LoadBalancerMetrics,
//! and the tagged `MetadataValue` bag they share.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// A scalar-or-json value in a metadata bag. Keeping this as a closed enum,
/// rather than letting `metadata` be an arbitrary `serde_json::Value`, keeps
/// numeric fields like `weight` readable as a typed `f64` without a parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Num(n) => Some(*n),
            MetadataValue::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            MetadataValue::Json(v) => v.as_str(),
            _ => None,
        }
    }
}

pub type Metadata = HashMap<String, MetadataValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    #[serde(rename = "2024-11-26")]
    V2024_11_26,
    #[serde(rename = "2025-03-26")]
    V2025_03_26,
    #[serde(rename = "2025-06-18")]
    V2025_06_18,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Http,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSandboxSpec {
    #[serde(default)]
    pub required_for_untrusted: bool,
    #[serde(default)]
    pub allowed_volume_roots: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

/// The immutable descriptor for one back-end service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub protocol_version: ProtocolVersion,
    pub transport: Transport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub container: Option<ContainerSandboxSpec>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub untrusted: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Template {
    /// Validate: non-empty name (uniqueness is the store's job), and a
    /// stdio template must carry a command while an http/streamable-http
    /// one must carry an endpoint.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::BadInput("template name must be non-empty".into()));
        }
        if self.transport == Transport::Stdio && self.command.is_none() {
            return Err(GatewayError::BadInput(
                "stdio template must carry a command".into(),
            ));
        }
        if (self.transport == Transport::Http || self.transport == Transport::StreamableHttp)
            && self.endpoint.is_none()
        {
            return Err(GatewayError::BadInput(
                "http/streamable-http template must carry an endpoint".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Idle,
    Initializing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Crashed,
    Restarting,
    Upgrading,
    Maintenance,
}

impl InstanceState {
    /// Only `Running` instances may accept `send`/`receive` calls; every
    /// other state refuses with `NotConnected`.
    pub fn accepts_io(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub template_name: String,
    /// A copy of the template config at creation time — a foreign key to
    /// the template by value, not by reference, so a later template edit
    /// never mutates instances already spawned from it.
    pub template: Template,
    pub state: InstanceState,
    #[serde(default)]
    pub pid: Option<u32>,
    pub started_at: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Set from `InstanceOverrides::managed` at creation time. A managed
    /// instance's lifecycle and health are owned by an outer orchestrator,
    /// so the periodic sweep skips it.
    #[serde(default)]
    pub managed: bool,
}

impl Instance {
    pub fn new(template: &Template) -> Self {
        let now = now_ms();
        Self {
            id: generate_instance_id(&template.name, now),
            template_name: template.name.clone(),
            template: template.clone(),
            state: InstanceState::Idle,
            pid: None,
            started_at: now,
            error_count: 0,
            metadata: Metadata::new(),
            managed: false,
        }
    }

    pub fn weight(&self) -> f64 {
        self.metadata
            .get("weight")
            .and_then(MetadataValue::as_f64)
            .unwrap_or(1.0)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `"<template-name>-<epoch-ms>-<rand6>"`.
pub fn generate_instance_id(template_name: &str, epoch_ms: u64) -> String {
    format!("{}-{}-{}", template_name, epoch_ms, rand6())
}

pub(crate) fn rand6() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            timestamp: now_ms(),
        }
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerMetrics {
    pub service_id: String,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time: f64,
    pub last_request_time: Option<u64>,
    /// Internal running-mean accumulator backing `avg_response_time`.
    #[serde(skip)]
    pub(crate) running_mean: latency::RunningMean,
}

impl LoadBalancerMetrics {
    pub fn zero(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            request_count: 0,
            error_count: 0,
            avg_response_time: 0.0,
            last_request_time: None,
            running_mean: latency::RunningMean::new(),
        }
    }

    /// Record one call's outcome: bump `request_count`, bump `error_count`
    /// on failure, and fold the latency into the running mean.
    pub fn record(&mut self, latency_ms: u64, success: bool) {
        self.request_count += 1;
        if !success {
            self.error_count += 1;
        }
        self.avg_response_time = self.running_mean.update(latency_ms as f64);
        self.last_request_time = Some(now_ms());
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_template_without_command_is_bad_input() {
        let t = Template {
            name: "x".into(),
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
        assert!(matches!(t.validate(), Err(GatewayError::BadInput(_))));
    }

    #[test]
    fn empty_name_is_bad_input() {
        let t = Template {
            name: "".into(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport: Transport::Stdio,
            command: Some("node".into()),
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
        assert!(t.validate().is_err());
    }

    #[test]
    fn instance_id_embeds_template_name_and_epoch() {
        let id = generate_instance_id("echo", 1000);
        assert!(id.starts_with("echo-1000-"));
        assert_eq!(id.len(), "echo-1000-".len() + 6);
    }

    #[test]
    fn metrics_running_mean_is_simple_average() {
        let mut m = LoadBalancerMetrics::zero("svc-a");
        m.record(100, true);
        m.record(200, true);
        assert_eq!(m.request_count, 2);
        assert_eq!(m.error_count, 0);
        assert!((m.avg_response_time - 150.0).abs() < 1e-9);
    }

    #[test]
    fn metrics_error_rate() {
        let mut m = LoadBalancerMetrics::zero("svc-a");
        m.record(10, true);
        m.record(10, false);
        assert!((m.error_rate() - 0.5).abs() < 1e-9);
    }
}
