//! Knitnet reconciliation controller
//!
//! Dispatches on the resource's action: `broker` initializes the globalnet
//! ledger on the broker cluster, `join` labels a gateway node and runs one
//! join attempt, `all` does both. The outcome becomes a single status
//! phase; the detail is published as Events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use knitnet_common::crd::{Knitnet, KnitnetPhase, KnitnetStatus};
use knitnet_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use knitnet_common::{Error, Result, FIELD_MANAGER, OPERATOR_NAMESPACE};
use knitnet_discovery::KubeIntrospection;
use knitnet_globalnet::{ConfigMapLedger, GlobalAllocator};
use knitnet_join::{
    Credential, JoinOrchestrator, JoinRequest, KubeRequirementsChecker, Registrar,
    ResolvedNetworkConfig, SecretCredentialSource, SubmarinerRegistrar,
};

use crate::gateway::ensure_gateway;

/// Requeue interval after a successful reconcile
pub const SUCCESS_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval after a failed attempt
pub const FAILURE_REQUEUE: Duration = Duration::from_secs(60);
/// Requeue interval when reconcile itself errors
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Where the broker domain lives
#[derive(Clone, Debug)]
pub struct BrokerSettings {
    /// Namespace holding the ledger and cluster credentials
    pub namespace: String,
    /// Broker API server URL handed to the registration payload
    pub api_server: String,
}

/// Controller context shared by every reconcile
pub struct Context {
    /// Client for the local cluster
    pub client: Client,
    /// Client for the broker cluster (the local one when co-located)
    pub broker_client: Client,
    /// Broker location
    pub broker: BrokerSettings,
    /// Event publisher for `Knitnet` resources
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Context publishing Kubernetes Events as `knitnet-controller`
    pub fn new(client: Client, broker_client: Client, broker: BrokerSettings) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
        Self {
            client,
            broker_client,
            broker,
            events,
        }
    }

    /// Replace the event publisher
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    fn allocator(&self) -> GlobalAllocator {
        let ledger = ConfigMapLedger::new(self.broker_client.clone(), &self.broker.namespace);
        GlobalAllocator::new(Arc::new(ledger))
    }
}

/// Reconcile a Knitnet
#[instrument(
    skip(knitnet, ctx),
    fields(knitnet = %knitnet.name_any(), action = %knitnet.spec.action)
)]
pub async fn reconcile(knitnet: Arc<Knitnet>, ctx: Arc<Context>) -> Result<Action> {
    info!("Reconciling Knitnet");
    let object_ref = knitnet.object_ref(&());

    let result = apply(&knitnet, &ctx, &object_ref).await;
    let phase = phase_for(&result);
    update_status(&ctx.client, &knitnet, phase).await?;

    match result {
        Ok(()) => Ok(Action::requeue(SUCCESS_REQUEUE)),
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "Knitnet reconciliation failed");
            Ok(Action::requeue(FAILURE_REQUEUE))
        }
    }
}

/// Error policy for the controller
pub fn error_policy(knitnet: Arc<Knitnet>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        knitnet = %knitnet.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn apply(knitnet: &Knitnet, ctx: &Context, object_ref: &ObjectReference) -> Result<()> {
    if let Err(e) = knitnet.spec.validate() {
        let reason = if knitnet.spec.action.joins() {
            reasons::JOIN_FAILED
        } else {
            reasons::BROKER_FAILED
        };
        ctx.events
            .publish(
                object_ref,
                EventType::Warning,
                reason,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }

    let allocator = ctx.allocator();
    if knitnet.spec.action.deploys_broker() {
        deploy_broker(knitnet, ctx, object_ref, &allocator).await?;
    }
    if knitnet.spec.action.joins() {
        join(knitnet, ctx, object_ref, allocator).await?;
    }
    Ok(())
}

async fn deploy_broker(
    knitnet: &Knitnet,
    ctx: &Context,
    object_ref: &ObjectReference,
    allocator: &GlobalAllocator,
) -> Result<()> {
    let config = &knitnet.spec.broker_config;
    match allocator
        .initialize(
            &config.globalnet_cidr_range,
            config.default_globalnet_cluster_size,
            config.globalnet_enable,
        )
        .await
    {
        Ok(record) => {
            let note = format!(
                "globalnet {} on {} ({} clusters assigned)",
                if record.globalnet_enabled { "enabled" } else { "disabled" },
                record.supernet,
                record.assignments.len()
            );
            ctx.events
                .publish(
                    object_ref,
                    EventType::Normal,
                    reasons::BROKER_READY,
                    actions::DEPLOY_BROKER,
                    Some(note),
                )
                .await;
            Ok(())
        }
        Err(e) => {
            ctx.events
                .publish(
                    object_ref,
                    EventType::Warning,
                    reasons::BROKER_FAILED,
                    actions::DEPLOY_BROKER,
                    Some(e.to_string()),
                )
                .await;
            Err(e)
        }
    }
}

async fn join(
    knitnet: &Knitnet,
    ctx: &Context,
    object_ref: &ObjectReference,
    allocator: GlobalAllocator,
) -> Result<()> {
    let join_config = knitnet
        .spec
        .join_config
        .as_ref()
        .ok_or_else(|| Error::malformed("joinConfig", "required to join"))?;

    if join_config.label_gateway && knitnet.spec.broker_config.connectivity_enabled {
        if let Some(node) = ensure_gateway(&ctx.client).await? {
            ctx.events
                .publish(
                    object_ref,
                    EventType::Normal,
                    reasons::GATEWAY_LABELED,
                    actions::JOIN,
                    Some(format!("labeled node {node} as gateway")),
                )
                .await;
        }
    }

    let orchestrator = JoinOrchestrator::builder()
        .cluster(Arc::new(KubeIntrospection::new(ctx.client.clone())))
        .requirements(Arc::new(KubeRequirementsChecker::new(ctx.client.clone())))
        .credentials(Arc::new(SecretCredentialSource::new(
            ctx.broker_client.clone(),
            &ctx.broker.namespace,
        )))
        .registrar(registrar_for(knitnet, ctx))
        .allocator(Some(allocator))
        .build()?;

    let outcome = orchestrator.run(&JoinRequest::from(join_config)).await;

    if let Some(resolved) = &outcome.resolved {
        ctx.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::NETWORK_DISCOVERED,
                actions::JOIN,
                Some(format!(
                    "plugin {}, service CIDR {}, cluster CIDR {}",
                    resolved.network_plugin, resolved.service_cidr.cidr, resolved.cluster_cidr.cidr
                )),
            )
            .await;
        if let Some(global_cidr) = resolved.global_cidr {
            ctx.events
                .publish(
                    object_ref,
                    EventType::Normal,
                    reasons::GLOBAL_CIDR_ALLOCATED,
                    actions::JOIN,
                    Some(format!("global CIDR {global_cidr}")),
                )
                .await;
        }
    }

    if outcome.is_success() {
        ctx.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::JOIN_SUCCEEDED,
                actions::JOIN,
                Some(format!("cluster {} joined", outcome.cluster_id)),
            )
            .await;
    } else if let (Some(phase), Some(error)) = (&outcome.failed_in, &outcome.error) {
        ctx.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::JOIN_FAILED,
                actions::JOIN,
                Some(failure_note(*phase, error)),
            )
            .await;
    }

    outcome.into_result().map(|_| ())
}

/// Registration target for the join: the `Submariner` resource only when
/// tunnel connectivity is deployed
fn registrar_for(knitnet: &Knitnet, ctx: &Context) -> Arc<dyn Registrar> {
    if knitnet.spec.broker_config.connectivity_enabled {
        Arc::new(SubmarinerRegistrar::new(
            ctx.client.clone(),
            ctx.broker.api_server.clone(),
            ctx.broker.namespace.clone(),
        ))
    } else {
        Arc::new(ConnectivityDisabled)
    }
}

/// Completes the join without writing a `Submariner` resource
struct ConnectivityDisabled;

#[async_trait]
impl Registrar for ConnectivityDisabled {
    async fn register(&self, resolved: &ResolvedNetworkConfig, _credential: &Credential) -> Result<()> {
        info!(
            cluster_id = %resolved.cluster_id,
            "Connectivity disabled, skipping Submariner registration"
        );
        Ok(())
    }
}

fn failure_note(phase: knitnet_join::JoinPhase, error: &Error) -> String {
    format!("failed in {phase} ({}): {error}", error.kind())
}

/// Status phase for the outcome of an attempt
fn phase_for(result: &Result<()>) -> KnitnetPhase {
    match result {
        Ok(()) => KnitnetPhase::Running,
        Err(_) => KnitnetPhase::Failed,
    }
}

fn status_changed(current: Option<&KnitnetStatus>, phase: KnitnetPhase) -> bool {
    current.map_or(true, |status| status.phase != phase)
}

/// Patch the status phase, skipping the write when it is unchanged
async fn update_status(client: &Client, knitnet: &Knitnet, phase: KnitnetPhase) -> Result<()> {
    if !status_changed(knitnet.status.as_ref(), phase) {
        debug!(%phase, "Status unchanged, skipping update");
        return Ok(());
    }

    let name = knitnet.name_any();
    let namespace = knitnet
        .namespace()
        .unwrap_or_else(|| OPERATOR_NAMESPACE.to_string());

    let status = KnitnetStatus {
        phase,
        last_updated: Some(chrono::Utc::now().to_rfc3339()),
    };
    let patch = serde_json::json!({ "status": status });

    let api: Api<Knitnet> = Api::namespaced(client.clone(), &namespace);
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(%phase, "Knitnet status updated");
    Ok(())
}
