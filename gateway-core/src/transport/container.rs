//! The container adapter: runs `template.command` inside a sandboxed
//! container instead of as a bare child process. It reuses the stdio
//! adapter's framing and correlation code wholesale — the only difference
//! is how the child is launched.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{GatewayError, GatewayResult};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::model::Template;

use super::stdio::StdioAdapter;
use super::{AdapterEvent, TransportAdapter};

/// The container runtime binary invoked to launch the sandboxed process.
/// Overridable per `GatewayConfig`; `docker` by convention.
pub const DEFAULT_RUNTIME: &str = "docker";

pub struct ContainerAdapter {
    runtime_binary: String,
    inner: StdioAdapter,
}

impl ContainerAdapter {
    pub fn new(runtime_binary: impl Into<String>) -> Self {
        Self {
            runtime_binary: runtime_binary.into(),
            inner: StdioAdapter::new(),
        }
    }

    /// Rewrite the template's `command`/`args` into an invocation of the
    /// container runtime with the security-relevant flags applied, then
    /// delegate to the stdio adapter for the actual spawn/framing.
    fn wrap(&self, template: &Template) -> GatewayResult<Template> {
        let command = template
            .command
            .clone()
            .ok_or_else(|| GatewayError::BadInput("container template missing command".into()))?;

        let spec = template.container.clone().unwrap_or_default();
        for root in &spec.allowed_volume_roots {
            if !std::path::Path::new(root).is_absolute() {
                return Err(GatewayError::PolicyViolation(format!(
                    "volume root '{root}' must be an absolute path"
                )));
            }
        }

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--read-only".to_string(),
            "--network=none".to_string(),
        ];
        for root in &spec.allowed_volume_roots {
            args.push("-v".to_string());
            args.push(format!("{root}:{root}"));
        }
        if let Some(image) = &spec.image {
            args.push(image.clone());
        } else {
            return Err(GatewayError::PolicyViolation(
                "container sandbox requires an image".into(),
            ));
        }
        args.push(command);
        args.extend(template.args.iter().cloned());

        let mut wrapped = template.clone();
        wrapped.command = Some(self.runtime_binary.clone());
        wrapped.args = args;
        Ok(wrapped)
    }
}

#[async_trait]
impl TransportAdapter for ContainerAdapter {
    async fn connect(&self, template: &Template) -> GatewayResult<()> {
        let wrapped = self.wrap(template)?;
        self.inner.connect(&wrapped).await
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.inner.disconnect().await
    }

    async fn send(&self, msg: JsonRpcRequest) -> GatewayResult<()> {
        self.inner.send(msg).await
    }

    async fn send_and_receive(&self, msg: JsonRpcRequest, timeout_ms: u64) -> GatewayResult<JsonRpcResponse> {
        self.inner.send_and_receive(msg, timeout_ms).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.subscribe()
    }

    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }
}

/// Whether `template` must be served by the container adapter rather than
/// plain stdio, given the gateway's sandbox profile.
pub fn requires_container(template: &Template, sandbox_profile_locked_down: bool) -> bool {
    if sandbox_profile_locked_down {
        return true;
    }
    template.untrusted
        && template
            .container
            .as_ref()
            .map(|c| c.required_for_untrusted)
            .unwrap_or(false)
}
