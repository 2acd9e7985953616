//! Transport adapters: the objects that own the I/O channel to one back-end
//! instance, frame JSON-RPC over it, and correlate requests with responses.

pub mod container;
pub mod http;
mod pending;
pub mod stdio;

pub use pending::{connection_closed, PendingCalls};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::GatewayResult;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::model::Template;

/// One event an adapter reports about its own channel. Replaces a general
/// emitter with the narrow, closed set the wire actually produces.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Sent(JsonRpcRequest),
    Received(JsonRpcResponse),
    Stderr(String),
    EnvHint(String),
    Disconnect { code: Option<i32>, signal: Option<i32> },
    Error(String),
}

/// The interface every back-end transport implements, whether it's a child
/// process on stdio, an HTTP/SSE endpoint, or a sandboxed container.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn connect(&self, template: &Template) -> GatewayResult<()>;
    async fn disconnect(&self) -> GatewayResult<()>;
    async fn send(&self, msg: JsonRpcRequest) -> GatewayResult<()>;
    async fn send_and_receive(&self, msg: JsonRpcRequest, timeout_ms: u64) -> GatewayResult<JsonRpcResponse>;
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
    /// The OS pid of the child process this adapter owns, if any. `None`
    /// for transports with no child process (HTTP) or while disconnected.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// `"req-<epoch-ms>-<rand6>"`, used to assign an id to a request that
/// arrives at `sendAndReceive` without one.
pub fn generate_request_id(epoch_ms: u64) -> String {
    format!("req-{epoch_ms}-{}", crate::model::rand6())
}

/// Stderr lines matching this shape get a synthetic `EnvHint` event so
/// operators can diagnose a missing secret without reading raw stderr.
pub fn env_hint_pattern() -> &'static regex::Regex {
    use once_cell::sync::Lazy;
    static RE: Lazy<regex::Regex> =
        Lazy::new(|| regex::Regex::new(r"\b([A-Z][A-Z0-9_]{2,})\s+environment variable is required\b").unwrap());
    &RE
}
