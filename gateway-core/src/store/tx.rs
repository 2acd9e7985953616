//! The staged-mutation buffer behind `ObservationStore::atomic_update`.
//!
//! A thread-local stack of buffers lets a nested `atomic_update` call (one
//! invoked from inside another, on the same thread) detect it isn't the
//! outermost caller and simply stage into the buffer already open rather
//! than opening — and committing — a buffer of its own.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::GatewayResult;
use crate::model::{HealthStatus, Instance, LoadBalancerMetrics, Template};

use super::InstancePatch;

pub(super) type SharedBuffer = Arc<Mutex<TxBuffer>>;

#[derive(Debug, Clone)]
pub(super) enum TxOp {
    SetTemplate(Template),
    RemoveTemplate(String),
    SetInstance(Instance),
    PatchInstance(String, InstancePatch),
    RemoveInstance(String),
    UpdateHealth(String, HealthStatus),
    RemoveHealth(String),
    UpdateMetrics(String, LoadBalancerMetrics),
    RemoveMetrics(String),
}

#[derive(Debug, Default)]
pub(super) struct TxBuffer {
    pub ops: Vec<TxOp>,
}

thread_local! {
    static STACK: RefCell<Vec<SharedBuffer>> = RefCell::new(Vec::new());
}

pub(super) fn push_buffer(buffer: SharedBuffer) {
    STACK.with(|s| s.borrow_mut().push(buffer));
}

pub(super) fn pop_buffer() {
    STACK.with(|s| {
        s.borrow_mut().pop();
    });
}

/// The buffer currently open on this thread, if any `atomic_update` call is
/// already in progress here.
pub(super) fn current_buffer() -> Option<SharedBuffer> {
    STACK.with(|s| s.borrow().last().cloned())
}

/// A handle into one in-flight transaction. Every staging method appends to
/// the shared buffer and never touches the store's actual tables — those
/// are only mutated once the outermost `atomic_update` call commits.
pub struct Transaction {
    buffer: SharedBuffer,
}

impl Transaction {
    pub(super) fn new(buffer: SharedBuffer) -> Self {
        Self { buffer }
    }

    fn push(&self, op: TxOp) -> GatewayResult<()> {
        self.buffer.lock().ops.push(op);
        Ok(())
    }

    pub fn set_template(&self, template: Template) -> GatewayResult<()> {
        template.validate()?;
        self.push(TxOp::SetTemplate(template))
    }

    pub fn remove_template(&self, name: String) -> GatewayResult<()> {
        self.push(TxOp::RemoveTemplate(name))
    }

    pub fn set_instance(&self, instance: Instance) -> GatewayResult<()> {
        self.push(TxOp::SetInstance(instance))
    }

    pub fn patch_instance(&self, id: String, patch: InstancePatch) -> GatewayResult<()> {
        self.push(TxOp::PatchInstance(id, patch))
    }

    pub fn remove_instance(&self, id: String) -> GatewayResult<()> {
        self.push(TxOp::RemoveInstance(id))
    }

    pub fn update_health(&self, instance_id: String, status: HealthStatus) -> GatewayResult<()> {
        self.push(TxOp::UpdateHealth(instance_id, status))
    }

    pub fn remove_health(&self, instance_id: String) -> GatewayResult<()> {
        self.push(TxOp::RemoveHealth(instance_id))
    }

    pub fn update_metrics(&self, service_id: String, metrics: LoadBalancerMetrics) -> GatewayResult<()> {
        self.push(TxOp::UpdateMetrics(service_id, metrics))
    }

    pub fn remove_metrics(&self, service_id: String) -> GatewayResult<()> {
        self.push(TxOp::RemoveMetrics(service_id))
    }
}
