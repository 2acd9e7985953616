//! The narrow, typed publish/subscribe surface the store emits on commit:
//! one closed enum rather than a general string-keyed event emitter.

use crate::model::{HealthStatus, Instance, LoadBalancerMetrics, Template};

#[derive(Debug, Clone)]
pub enum StoreEvent {
    TemplateSet(Template),
    TemplateRemove(String),
    InstanceSet(Instance),
    InstancePatch(Instance),
    InstanceRemove(String),
    HealthUpdate(String, HealthStatus),
    HealthRemove(String),
    MetricsUpdate(String, LoadBalancerMetrics),
    MetricsRemove(String),
}

impl StoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StoreEvent::TemplateSet(_) => "template:set",
            StoreEvent::TemplateRemove(_) => "template:remove",
            StoreEvent::InstanceSet(_) => "instance:set",
            StoreEvent::InstancePatch(_) => "instance:patch",
            StoreEvent::InstanceRemove(_) => "instance:remove",
            StoreEvent::HealthUpdate(..) => "health:update",
            StoreEvent::HealthRemove(_) => "health:remove",
            StoreEvent::MetricsUpdate(..) => "metrics:update",
            StoreEvent::MetricsRemove(_) => "metrics:remove",
        }
    }
}
