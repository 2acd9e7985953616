//! Per-request context and mutable state shared across every middleware
//! hook in one dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;

use crate::error::GatewayError;
use crate::model::Metadata;

/// A hand-rolled cancellation signal (`Arc<Notify>` + `AtomicBool`) rather
/// than pulling in `tokio-util` for the one primitive this pipeline needs.
#[derive(Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Immutable request identity and timing, carried alongside the mutable
/// [`PipelineState`].
#[derive(Clone)]
pub struct Context {
    pub request_id: String,
    pub start_time: u64,
    pub metadata: Metadata,
    pub cancel: Option<CancelSignal>,
}

impl Context {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            start_time: crate::model::now_ms(),
            metadata: Metadata::new(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// The six stages run in fixed order around every dispatched tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BeforeAgent,
    BeforeModel,
    AfterModel,
    BeforeTool,
    AfterTool,
    AfterAgent,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::BeforeAgent,
        Stage::BeforeModel,
        Stage::AfterModel,
        Stage::BeforeTool,
        Stage::AfterTool,
        Stage::AfterAgent,
    ];
}

/// The mutable per-request state every middleware reads and writes. Never
/// garbage-collected mid-request; lives for the whole dispatch.
pub struct PipelineState {
    pub stage: Stage,
    pub values: HashMap<String, Value>,
    pub aborted: bool,
    pub error: Option<GatewayError>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            stage: Stage::BeforeAgent,
            values: HashMap::new(),
            aborted: false,
            error: None,
        }
    }

    pub fn abort(&mut self, error: GatewayError) {
        self.aborted = true;
        self.error = Some(error);
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
