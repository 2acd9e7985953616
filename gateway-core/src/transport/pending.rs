//! The per-adapter pending-call table: a map from `messageId` to the
//! one-shot completion handle awaiting its response.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcResponse;

#[derive(Default)]
pub struct PendingCalls {
    inner: DashMap<Value, oneshot::Sender<JsonRpcResponse>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Value) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(id, tx);
        rx
    }

    /// Resolve the pending call matching `response.id`, if one is waiting.
    /// Returns `true` if a waiter was found and completed.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        if let Some((_, tx)) = self.inner.remove(response.id()) {
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    pub fn cancel(&self, id: &Value) {
        self.inner.remove(id);
    }

    /// Fail every outstanding call with `ConnectionClosed`, draining the
    /// table. Called on disconnect or process exit.
    pub fn fail_all(&self, reason: &str) {
        for (_, tx) in self.inner.clone().into_iter() {
            drop(tx);
        }
        self.inner.clear();
        let _ = reason;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// The error a still-pending call's receiver observes once its sender is
/// dropped without resolving — the caller maps a `RecvError` to this.
pub fn connection_closed(message_id: &Value) -> GatewayError {
    GatewayError::ConnectionClosed(format!("pending call {message_id} closed"))
}
