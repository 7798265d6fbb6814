//! Kubernetes Event recording for Function condition changes
//!
//! Events are fire-and-forget: failures are logged and never returned. A
//! failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::{Condition, ConditionStatus};

/// Publishes Kubernetes Events on Functions
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

/// Warning for False conditions, Normal otherwise
pub fn event_type_for(condition: &Condition) -> EventType {
    match condition.status {
        ConditionStatus::False => EventType::Warning,
        ConditionStatus::True | ConditionStatus::Unknown => EventType::Normal,
    }
}

/// Publish the Event matching a freshly written condition
pub async fn publish_condition(
    publisher: &dyn EventPublisher,
    resource_ref: &ObjectReference,
    condition: &Condition,
) {
    publisher
        .publish(
            resource_ref,
            event_type_for(condition),
            &condition.reason.to_string(),
            actions::RECONCILE,
            Some(condition.message.clone()),
        )
        .await;
}
