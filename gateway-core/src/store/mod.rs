//! The Observation Store: the single source of truth for templates,
//! instances, health statuses, and load-balancer metrics.
//!
//! The four maps preserve insertion order (an `IndexMap` rather than a
//! `DashMap`, since listing snapshots must come back in registration
//! order), and mutations are wrapped in a transaction abstraction so a
//! caller can stage several edits and have them commit — and emit their
//! events — atomically.

mod event;
mod tx;

pub use event::StoreEvent;
pub use tx::Transaction;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{GatewayError, GatewayResult};
use crate::model::{HealthStatus, Instance, LoadBalancerMetrics, Template};

use tx::{TxBuffer, TxOp};

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Partial update to an instance's mutable fields. `None` fields are left
/// untouched; this is the "patch", not the "set".
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub state: Option<crate::model::InstanceState>,
    pub pid: Option<Option<u32>>,
    pub error_count: Option<u64>,
    pub metadata: Option<crate::model::Metadata>,
}

impl InstancePatch {
    fn apply(&self, instance: &mut Instance) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(pid) = self.pid {
            instance.pid = pid;
        }
        if let Some(error_count) = self.error_count {
            instance.error_count = error_count;
        }
        if let Some(metadata) = self.metadata.clone() {
            instance.metadata = metadata;
        }
    }
}

struct Tables {
    templates: RwLock<IndexMap<String, Template>>,
    instances: RwLock<IndexMap<String, Instance>>,
    health: RwLock<IndexMap<String, HealthStatus>>,
    metrics: RwLock<IndexMap<String, LoadBalancerMetrics>>,
}

impl Tables {
    fn new() -> Self {
        Self {
            templates: RwLock::new(IndexMap::new()),
            instances: RwLock::new(IndexMap::new()),
            health: RwLock::new(IndexMap::new()),
            metrics: RwLock::new(IndexMap::new()),
        }
    }
}

/// The store proper. Cheap to clone (it's an `Arc` inside) and safe to
/// share across every component that needs to read or mutate gateway state.
#[derive(Clone)]
pub struct ObservationStore {
    inner: Arc<Inner>,
}

struct Inner {
    tables: Tables,
    revision: AtomicU64,
    /// Serializes the apply-and-emit step of every commit. Readers never
    /// take this; only writers do, and only around the commit itself.
    commit_lock: Mutex<()>,
    next_sub_id: AtomicU64,
    listeners: RwLock<HashMap<u64, Listener>>,
}

impl Default for ObservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Tables::new(),
                revision: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                next_sub_id: AtomicU64::new(0),
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    // ---- reads -----------------------------------------------------

    pub fn get_template(&self, name: &str) -> Option<Template> {
        self.inner.tables.templates.read().get(name).cloned()
    }

    pub fn list_templates(&self) -> Vec<Template> {
        self.inner.tables.templates.read().values().cloned().collect()
    }

    pub fn get_instance(&self, id: &str) -> Option<Instance> {
        self.inner.tables.instances.read().get(id).cloned()
    }

    /// All instances, or only those for one template, in insertion order.
    pub fn list_instances(&self, template_name: Option<&str>) -> Vec<Instance> {
        let instances = self.inner.tables.instances.read();
        match template_name {
            Some(name) => instances
                .values()
                .filter(|i| i.template_name == name)
                .cloned()
                .collect(),
            None => instances.values().cloned().collect(),
        }
    }

    pub fn get_health(&self, instance_id: &str) -> Option<HealthStatus> {
        self.inner.tables.health.read().get(instance_id).cloned()
    }

    pub fn get_metrics(&self, service_id: &str) -> Option<LoadBalancerMetrics> {
        self.inner.tables.metrics.read().get(service_id).cloned()
    }

    // ---- single-op writes, each its own one-op transaction ---------

    pub fn set_template(&self, template: Template) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.set_template(template.clone()))
    }

    pub fn remove_template(&self, name: &str) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.remove_template(name.to_string()))
    }

    pub fn set_instance(&self, instance: Instance) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.set_instance(instance.clone()))
    }

    pub fn patch_instance(&self, id: &str, patch: InstancePatch) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.patch_instance(id.to_string(), patch.clone()))
    }

    /// Remove an instance and cascade-delete its health status and metrics,
    /// in that order: instance, then health, then metrics.
    pub fn remove_instance(&self, id: &str) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.remove_instance(id.to_string()))
    }

    pub fn update_health(&self, instance_id: &str, status: HealthStatus) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.update_health(instance_id.to_string(), status.clone()))
    }

    pub fn remove_health(&self, instance_id: &str) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.remove_health(instance_id.to_string()))
    }

    pub fn update_metrics(&self, service_id: &str, metrics: LoadBalancerMetrics) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.update_metrics(service_id.to_string(), metrics.clone()))
    }

    pub fn remove_metrics(&self, service_id: &str) -> GatewayResult<()> {
        self.atomic_update(|tx| tx.remove_metrics(service_id.to_string()))
    }

    // ---- transactions ------------------------------------------------

    /// Run `f` against a `Transaction` that buffers every mutation. If `f`
    /// returns `Ok`, the buffered ops are applied and their events emitted
    /// atomically; if it returns `Err`, nothing the buffer holds is ever
    /// applied. Nested calls (an `atomic_update` invoked from inside
    /// another one, on the same thread) share the outermost buffer and
    /// only the outermost call commits — this is what lets a higher-level
    /// operation compose several store edits into one all-or-nothing unit
    /// without the inner helpers needing to know they're nested.
    pub fn atomic_update<F>(&self, f: F) -> GatewayResult<()>
    where
        F: FnOnce(&Transaction) -> GatewayResult<()>,
    {
        if let Some(buffer) = tx::current_buffer() {
            // Nested: just stage into the buffer already open on this thread.
            let txn = Transaction::new(buffer);
            return f(&txn);
        }

        let buffer = Arc::new(parking_lot::Mutex::new(TxBuffer::default()));
        tx::push_buffer(buffer.clone());
        let result = f(&Transaction::new(buffer.clone()));
        tx::pop_buffer();

        result?;

        let ops = std::mem::take(&mut buffer.lock().ops);
        if ops.is_empty() {
            return Ok(());
        }
        self.commit(ops)
    }

    fn commit(&self, ops: Vec<TxOp>) -> GatewayResult<()> {
        let _guard = self.inner.commit_lock.lock();
        let mut events = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                TxOp::SetTemplate(t) => {
                    self.inner.tables.templates.write().insert(t.name.clone(), t.clone());
                    events.push(StoreEvent::TemplateSet(t));
                }
                TxOp::RemoveTemplate(name) => {
                    if self.inner.tables.templates.write().shift_remove(&name).is_some() {
                        events.push(StoreEvent::TemplateRemove(name));
                    }
                }
                TxOp::SetInstance(i) => {
                    self.inner.tables.instances.write().insert(i.id.clone(), i.clone());
                    events.push(StoreEvent::InstanceSet(i));
                }
                TxOp::PatchInstance(id, patch) => {
                    let mut instances = self.inner.tables.instances.write();
                    match instances.get_mut(&id) {
                        Some(instance) => {
                            patch.apply(instance);
                            events.push(StoreEvent::InstancePatch(instance.clone()));
                        }
                        None => {
                            return Err(GatewayError::NotFound(format!(
                                "instance {id} not found for patch"
                            )));
                        }
                    }
                }
                TxOp::RemoveInstance(id) => {
                    let removed = self.inner.tables.instances.write().shift_remove(&id);
                    if removed.is_some() {
                        events.push(StoreEvent::InstanceRemove(id.clone()));
                        if self.inner.tables.health.write().shift_remove(&id).is_some() {
                            events.push(StoreEvent::HealthRemove(id.clone()));
                        }
                        if self.inner.tables.metrics.write().shift_remove(&id).is_some() {
                            events.push(StoreEvent::MetricsRemove(id));
                        }
                    }
                }
                TxOp::UpdateHealth(id, status) => {
                    self.inner.tables.health.write().insert(id.clone(), status.clone());
                    events.push(StoreEvent::HealthUpdate(id, status));
                }
                TxOp::RemoveHealth(id) => {
                    if self.inner.tables.health.write().shift_remove(&id).is_some() {
                        events.push(StoreEvent::HealthRemove(id));
                    }
                }
                TxOp::UpdateMetrics(id, metrics) => {
                    self.inner.tables.metrics.write().insert(id.clone(), metrics.clone());
                    events.push(StoreEvent::MetricsUpdate(id, metrics));
                }
                TxOp::RemoveMetrics(id) => {
                    if self.inner.tables.metrics.write().shift_remove(&id).is_some() {
                        events.push(StoreEvent::MetricsRemove(id));
                    }
                }
            }
        }

        if events.is_empty() {
            return Ok(());
        }

        self.inner.revision.fetch_add(1, Ordering::SeqCst);

        let listeners: Vec<Listener> = self.inner.listeners.read().values().cloned().collect();
        for event in &events {
            for listener in &listeners {
                let listener = listener.clone();
                let event = event.clone();
                // A panicking subscriber must not poison the store or take
                // down the rest of the subscriber chain with it.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    listener(&event);
                }));
                if outcome.is_err() {
                    tracing::error!(event = event.name(), "store subscriber panicked");
                }
            }
        }

        Ok(())
    }

    /// Register a listener invoked synchronously, in order, for every
    /// event a commit produces. Returns an id usable with `unsubscribe`.
    pub fn subscribe<F>(&self, listener: F) -> u64
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.write().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.listeners.write().remove(&id);
    }
}
