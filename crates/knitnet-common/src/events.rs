//! Kubernetes Event recording for knitnet controllers.
//!
//! Join attempts end in a single `Running`/`Failed` phase; the detail of what
//! happened (which probe matched, which block was assigned, which conflict
//! could not be resolved) is published as Events on the owning `Knitnet`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What was being done (see [`actions`])
    /// * `note` - Optional human-readable detail
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
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
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops everything, for tests and dry runs.
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

/// Well-known event reason strings.
pub mod reasons {
    /// Globalnet ledger exists and is consistent
    pub const BROKER_READY: &str = "BrokerReady";
    /// Broker-side ledger initialization failed
    pub const BROKER_FAILED: &str = "BrokerFailed";
    /// Cluster network discovered
    pub const NETWORK_DISCOVERED: &str = "NetworkDiscovered";
    /// Global CIDR block committed for this cluster
    pub const GLOBAL_CIDR_ALLOCATED: &str = "GlobalCIDRAllocated";
    /// Join attempt completed
    pub const JOIN_SUCCEEDED: &str = "JoinSucceeded";
    /// Join attempt ended in Failed
    pub const JOIN_FAILED: &str = "JoinFailed";
    /// Gateway node labeled
    pub const GATEWAY_LABELED: &str = "GatewayLabeled";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Initializing the broker's globalnet ledger
    pub const DEPLOY_BROKER: &str = "DeployBroker";
    /// Running a join attempt
    pub const JOIN: &str = "Join";
}
