//! Join workflow state machine
//!
//! ```text
//! Discovering -> Validating -> Allocating -> Registering -> Succeeded
//!       \             \             \             \
//!        +-------------+-------------+-------------+--> Failed
//! ```
//!
//! `Allocating` is skipped when no allocator is configured. The broker
//! credential is awaited on the way into `Registering`; running out of
//! patience there fails the attempt in the `Registering` phase. Each
//! attempt is independent: anything already committed to the ledger is
//! reused on the next run.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info, instrument, warn};

use knitnet_common::retry::Backoff;
use knitnet_common::{Error, Result};
use knitnet_discovery::{discover, ClusterIntrospection, ClusterNetwork};
use knitnet_globalnet::{AllocationRequest, GlobalAllocator};

use crate::credential::{cluster_identity, wait_for_credential, Credential, CredentialSource};
use crate::registration::Registrar;
use crate::request::{resolve_network, JoinRequest, ResolvedNetworkConfig};
use crate::requirements::{ensure_met, RequirementsChecker};

/// Phase of a join attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPhase {
    /// Probing the cluster network
    Discovering,
    /// Checking the request and cluster preconditions
    Validating,
    /// Committing a global block to the ledger
    Allocating,
    /// Waiting for credentials and registering downstream
    Registering,
    /// Attempt completed
    Succeeded,
    /// Attempt ended with an error
    Failed,
}

impl std::fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovering => write!(f, "Discovering"),
            Self::Validating => write!(f, "Validating"),
            Self::Allocating => write!(f, "Allocating"),
            Self::Registering => write!(f, "Registering"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Transition data carried between phases
#[derive(Debug)]
enum JoinState {
    Discovering,
    Validating {
        resolved: ResolvedNetworkConfig,
    },
    Allocating {
        resolved: ResolvedNetworkConfig,
        request: AllocationRequest,
    },
    Registering {
        resolved: ResolvedNetworkConfig,
        credential: Credential,
    },
    Succeeded {
        resolved: ResolvedNetworkConfig,
    },
    Failed {
        phase: JoinPhase,
        error: Error,
        resolved: Option<ResolvedNetworkConfig>,
    },
}

impl JoinState {
    fn phase(&self) -> JoinPhase {
        match self {
            Self::Discovering => JoinPhase::Discovering,
            Self::Validating { .. } => JoinPhase::Validating,
            Self::Allocating { .. } => JoinPhase::Allocating,
            Self::Registering { .. } => JoinPhase::Registering,
            Self::Succeeded { .. } => JoinPhase::Succeeded,
            Self::Failed { .. } => JoinPhase::Failed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    fn failed(phase: JoinPhase, error: Error, resolved: Option<ResolvedNetworkConfig>) -> Self {
        Self::Failed {
            phase,
            error,
            resolved,
        }
    }
}

/// Result of one join attempt
#[derive(Debug)]
pub struct JoinOutcome {
    /// Cluster the attempt was for
    pub cluster_id: String,
    /// `Succeeded` or `Failed`
    pub phase: JoinPhase,
    /// Phase the failure happened in
    pub failed_in: Option<JoinPhase>,
    /// Addressing as far as it was resolved
    pub resolved: Option<ResolvedNetworkConfig>,
    /// What went wrong
    pub error: Option<Error>,
}

impl JoinOutcome {
    /// True if the attempt reached `Succeeded`
    pub fn is_success(&self) -> bool {
        self.phase == JoinPhase::Succeeded
    }

    /// The resolved configuration, or the error that ended the attempt
    pub fn into_result(self) -> Result<ResolvedNetworkConfig> {
        match (self.error, self.resolved) {
            (Some(error), _) => Err(error),
            (None, Some(resolved)) => Ok(resolved),
            (None, None) => Err(Error::internal_with_context(
                "join",
                format!("attempt for {} ended without a configuration", self.cluster_id),
            )),
        }
    }
}

/// Drives a cluster through the join workflow
pub struct JoinOrchestrator {
    cluster: Arc<dyn ClusterIntrospection>,
    requirements: Arc<dyn RequirementsChecker>,
    credentials: Arc<dyn CredentialSource>,
    registrar: Arc<dyn Registrar>,
    allocator: Option<GlobalAllocator>,
    credential_backoff: Backoff,
}

/// Builder for [`JoinOrchestrator`]
#[derive(Default)]
pub struct JoinOrchestratorBuilder {
    cluster: Option<Arc<dyn ClusterIntrospection>>,
    requirements: Option<Arc<dyn RequirementsChecker>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    registrar: Option<Arc<dyn Registrar>>,
    allocator: Option<GlobalAllocator>,
    credential_backoff: Option<Backoff>,
}

impl JoinOrchestratorBuilder {
    /// Cluster to discover
    pub fn cluster(mut self, cluster: Arc<dyn ClusterIntrospection>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Precondition checks for the cluster
    pub fn requirements(mut self, requirements: Arc<dyn RequirementsChecker>) -> Self {
        self.requirements = Some(requirements);
        self
    }

    /// Where the broker credential is polled from
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Downstream registration
    pub fn registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Global allocator; without one, `Allocating` is skipped
    pub fn allocator(mut self, allocator: Option<GlobalAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Backoff for the credential wait, [`Backoff::credential_wait`] by default
    pub fn credential_backoff(mut self, backoff: Backoff) -> Self {
        self.credential_backoff = Some(backoff);
        self
    }

    /// Build the orchestrator; every collaborator except the allocator is required
    pub fn build(self) -> Result<JoinOrchestrator> {
        let missing = |what: &str| Error::internal_with_context("join", format!("orchestrator built without {what}"));
        Ok(JoinOrchestrator {
            cluster: self.cluster.ok_or_else(|| missing("cluster introspection"))?,
            requirements: self.requirements.ok_or_else(|| missing("requirements checker"))?,
            credentials: self.credentials.ok_or_else(|| missing("credential source"))?,
            registrar: self.registrar.ok_or_else(|| missing("registrar"))?,
            allocator: self.allocator,
            credential_backoff: self.credential_backoff.unwrap_or_else(Backoff::credential_wait),
        })
    }
}

impl JoinOrchestrator {
    /// Start building an orchestrator
    pub fn builder() -> JoinOrchestratorBuilder {
        JoinOrchestratorBuilder::default()
    }

    /// Run one join attempt to a terminal phase
    #[instrument(skip(self, request), fields(cluster_id = %request.cluster_id))]
    pub async fn run(&self, request: &JoinRequest) -> JoinOutcome {
        let mut state = JoinState::Discovering;
        while !state.is_terminal() {
            let from = state.phase();
            state = self.step(state, request).await;
            debug!(%from, to = %state.phase(), "Join transition");
        }

        match state {
            JoinState::Succeeded { resolved } => {
                info!(
                    service_cidr = %resolved.service_cidr.cidr,
                    cluster_cidr = %resolved.cluster_cidr.cidr,
                    global_cidr = ?resolved.global_cidr,
                    "Cluster joined"
                );
                JoinOutcome {
                    cluster_id: request.cluster_id.clone(),
                    phase: JoinPhase::Succeeded,
                    failed_in: None,
                    resolved: Some(resolved),
                    error: None,
                }
            }
            JoinState::Failed {
                phase,
                error,
                resolved,
            } => {
                warn!(phase = %phase, error = %error, "Join attempt failed");
                JoinOutcome {
                    cluster_id: request.cluster_id.clone(),
                    phase: JoinPhase::Failed,
                    failed_in: Some(phase),
                    resolved,
                    error: Some(error),
                }
            }
            other => JoinOutcome {
                cluster_id: request.cluster_id.clone(),
                phase: JoinPhase::Failed,
                failed_in: Some(other.phase()),
                resolved: None,
                error: Some(Error::internal_with_context("join", "state machine stopped early")),
            },
        }
    }

    async fn step(&self, state: JoinState, request: &JoinRequest) -> JoinState {
        match state {
            JoinState::Discovering => self.discover_network(request).await,
            JoinState::Validating { resolved } => self.validate(request, resolved).await,
            JoinState::Allocating { resolved, request } => self.allocate(resolved, &request).await,
            JoinState::Registering {
                resolved,
                credential,
            } => match self.registrar.register(&resolved, &credential).await {
                Ok(()) => JoinState::Succeeded { resolved },
                // The committed allocation stays; the next attempt reuses it
                Err(e) => JoinState::failed(JoinPhase::Registering, e, Some(resolved)),
            },
            terminal => terminal,
        }
    }

    async fn discover_network(&self, request: &JoinRequest) -> JoinState {
        let network: Option<ClusterNetwork> = match discover(self.cluster.as_ref()).await {
            Ok(network) => network,
            Err(e) => return JoinState::failed(JoinPhase::Discovering, e, None),
        };

        match resolve_network(request, network.as_ref()) {
            Ok(resolved) => JoinState::Validating { resolved },
            Err(e) => JoinState::failed(JoinPhase::Discovering, e, None),
        }
    }

    async fn validate(&self, request: &JoinRequest, resolved: ResolvedNetworkConfig) -> JoinState {
        if let Err(e) = request.validate() {
            return JoinState::failed(JoinPhase::Validating, e, Some(resolved));
        }

        let checked = match self.requirements.check().await {
            Ok(unmet) => ensure_met(unmet),
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            return JoinState::failed(JoinPhase::Validating, e, Some(resolved));
        }

        if self.allocator.is_none() {
            debug!("No global allocator configured, skipping allocation");
            return self.await_credential(resolved).await;
        }

        let allocation = AllocationRequest::new(request.cluster_id.as_str())
            .with_explicit_cidr(request.explicit_global_cidr.clone())
            .with_block_size(request.requested_block_size)
            .with_network_plugin(Some(resolved.network_plugin.clone()));
        match allocation.validate() {
            Ok(()) => JoinState::Allocating {
                resolved,
                request: allocation,
            },
            Err(e) => JoinState::failed(JoinPhase::Validating, e, Some(resolved)),
        }
    }

    async fn allocate(&self, mut resolved: ResolvedNetworkConfig, request: &AllocationRequest) -> JoinState {
        let Some(allocator) = self.allocator.as_ref() else {
            return self.await_credential(resolved).await;
        };

        match allocator.commit(request).await {
            Ok(cidr) => {
                resolved.global_cidr = cidr;
                log_allocation(&resolved.cluster_id, cidr);
                self.await_credential(resolved).await
            }
            Err(e) => JoinState::failed(JoinPhase::Allocating, e, Some(resolved)),
        }
    }

    async fn await_credential(&self, resolved: ResolvedNetworkConfig) -> JoinState {
        let identity = cluster_identity(&resolved.cluster_id);
        match wait_for_credential(self.credentials.as_ref(), &identity, &self.credential_backoff).await {
            Ok(credential) => JoinState::Registering {
                resolved,
                credential,
            },
            Err(e) => JoinState::failed(JoinPhase::Registering, e, Some(resolved)),
        }
    }
}

fn log_allocation(cluster_id: &str, cidr: Option<Ipv4Net>) {
    match cidr {
        Some(cidr) => info!(cluster_id, %cidr, "Global CIDR assigned"),
        None => info!(cluster_id, "Global addressing disabled on the broker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MockCredentialSource;
    use crate::registration::MockRegistrar;
    use crate::requirements::MockRequirementsChecker;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
    use knitnet_discovery::ProbeServiceOutcome;
    use knitnet_globalnet::{GlobalAllocationRecord, InMemoryLedger};
    use std::time::Duration;

    /// An OpenShift cluster: the first probe matches, nothing else is consulted
    struct OpenShiftCluster;

    #[async_trait]
    impl ClusterIntrospection for OpenShiftCluster {
        async fn get_config_map(&self, _: &str, _: &str) -> Result<Option<ConfigMap>> {
            Ok(None)
        }
        async fn list_pods(&self, _: &str) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }
        async fn get_service(&self, _: &str, _: &str) -> Result<Option<Service>> {
            Ok(None)
        }
        async fn get_openshift_network(&self) -> Result<Option<serde_json::Value>> {
            Ok(Some(serde_json::json!({
                "spec": {
                    "networkType": "OVNKubernetes",
                    "clusterNetwork": [{"cidr": "10.128.0.0/14", "hostPrefix": 23}],
                    "serviceNetwork": ["172.30.0.0/16"]
                }
            })))
        }
        async fn create_probe_service(&self, _: &str) -> Result<ProbeServiceOutcome> {
            Err(Error::internal("probe service must not be used"))
        }
        async fn delete_probe_service(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff {
            steps: 3,
            duration: Duration::from_millis(1),
            factor: 1.2,
            jitter: 0.0,
            cap: Duration::from_millis(5),
        }
    }

    fn credential() -> Credential {
        Credential {
            identity: "cluster-east".into(),
            token: "tok".into(),
            ca: Vec::new(),
        }
    }

    fn requirements_met() -> Arc<MockRequirementsChecker> {
        let mut checker = MockRequirementsChecker::new();
        checker.expect_check().returning(|| Ok(Vec::new()));
        Arc::new(checker)
    }

    fn credential_ready() -> Arc<MockCredentialSource> {
        let mut source = MockCredentialSource::new();
        source.expect_fetch().returning(|_| Ok(Some(credential())));
        Arc::new(source)
    }

    fn registrar_ok() -> Arc<MockRegistrar> {
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().returning(|_, _| Ok(()));
        Arc::new(registrar)
    }

    fn allocator(ledger: Arc<InMemoryLedger>) -> GlobalAllocator {
        GlobalAllocator::new(ledger)
    }

    fn ledger() -> Arc<InMemoryLedger> {
        let record = GlobalAllocationRecord::new("242.0.0.0/8".parse().unwrap(), 65536, true);
        Arc::new(InMemoryLedger::with_record(&record).unwrap())
    }

    fn orchestrator(
        requirements: Arc<dyn RequirementsChecker>,
        credentials: Arc<dyn CredentialSource>,
        registrar: Arc<dyn Registrar>,
        allocator: Option<GlobalAllocator>,
    ) -> JoinOrchestrator {
        JoinOrchestrator::builder()
            .cluster(Arc::new(OpenShiftCluster))
            .requirements(requirements)
            .credentials(credentials)
            .registrar(registrar)
            .allocator(allocator)
            .credential_backoff(fast_backoff())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_join_carries_discovered_and_allocated_addressing() {
        let orchestrator = orchestrator(
            requirements_met(),
            credential_ready(),
            registrar_ok(),
            Some(allocator(ledger())),
        );

        let outcome = orchestrator.run(&JoinRequest::new("east")).await;
        assert!(outcome.is_success(), "{outcome:?}");
        let resolved = outcome.into_result().unwrap();
        assert_eq!(resolved.service_cidr.cidr, "172.30.0.0/16");
        assert!(resolved.service_cidr.auto_detected);
        assert_eq!(resolved.cluster_cidr.cidr, "10.128.0.0/14");
        assert_eq!(resolved.network_plugin, "OVNKubernetes");
        assert_eq!(resolved.global_cidr, Some("242.0.0.0/16".parse().unwrap()));
    }

    #[tokio::test]
    async fn without_allocator_no_global_cidr_is_set() {
        let orchestrator = orchestrator(requirements_met(), credential_ready(), registrar_ok(), None);
        let resolved = orchestrator.run(&JoinRequest::new("east")).await.into_result().unwrap();
        assert_eq!(resolved.global_cidr, None);
    }

    #[tokio::test]
    async fn malformed_cluster_id_fails_validation_without_touching_ledger() {
        let ledger = ledger();
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().never();
        let orchestrator = orchestrator(
            requirements_met(),
            credential_ready(),
            Arc::new(registrar),
            Some(allocator(ledger.clone())),
        );

        let outcome = orchestrator.run(&JoinRequest::new("East_Cluster")).await;
        assert_eq!(outcome.phase, JoinPhase::Failed);
        assert_eq!(outcome.failed_in, Some(JoinPhase::Validating));
        assert!(matches!(outcome.error, Some(Error::MalformedInput { .. })));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn unmet_requirements_fail_validation() {
        let mut checker = MockRequirementsChecker::new();
        checker
            .expect_check()
            .returning(|| Ok(vec!["Kubernetes 1.14 is older than the minimum supported 1.15".into()]));
        let ledger = ledger();
        let orchestrator = orchestrator(
            Arc::new(checker),
            credential_ready(),
            registrar_ok(),
            Some(allocator(ledger.clone())),
        );

        let outcome = orchestrator.run(&JoinRequest::new("east")).await;
        assert_eq!(outcome.failed_in, Some(JoinPhase::Validating));
        assert!(matches!(outcome.error, Some(Error::Requirements { .. })));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn explicit_cidr_and_block_size_together_are_rejected_before_allocating() {
        let ledger = ledger();
        let orchestrator = orchestrator(
            requirements_met(),
            credential_ready(),
            registrar_ok(),
            Some(allocator(ledger.clone())),
        );
        let mut request = JoinRequest::new("east");
        request.explicit_global_cidr = Some("242.1.0.0/16".into());
        request.requested_block_size = Some(1024);

        let outcome = orchestrator.run(&request).await;
        assert_eq!(outcome.failed_in, Some(JoinPhase::Validating));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn allocation_failure_ends_in_allocating() {
        let orchestrator = orchestrator(
            requirements_met(),
            credential_ready(),
            registrar_ok(),
            Some(allocator(ledger())),
        );
        let mut request = JoinRequest::new("east");
        request.explicit_global_cidr = Some("10.0.0.0/16".into());

        let outcome = orchestrator.run(&request).await;
        assert_eq!(outcome.failed_in, Some(JoinPhase::Allocating));
        assert!(matches!(outcome.error, Some(Error::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn credential_timeout_is_a_registering_failure() {
        let mut source = MockCredentialSource::new();
        source.expect_fetch().times(3).returning(|_| Ok(None));
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().never();

        let orchestrator = orchestrator(requirements_met(), Arc::new(source), Arc::new(registrar), None);
        let outcome = orchestrator.run(&JoinRequest::new("east")).await;

        assert_eq!(outcome.failed_in, Some(JoinPhase::Registering));
        assert!(matches!(outcome.error, Some(Error::Timeout { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn credential_is_requested_for_cluster_identity() {
        let mut source = MockCredentialSource::new();
        source
            .expect_fetch()
            .withf(|identity| identity == "cluster-east")
            .returning(|_| Ok(Some(credential())));

        let orchestrator = orchestrator(requirements_met(), Arc::new(source), registrar_ok(), None);
        assert!(orchestrator.run(&JoinRequest::new("east")).await.is_success());
    }

    #[tokio::test]
    async fn missing_collaborator_is_a_build_error() {
        let built = JoinOrchestrator::builder()
            .cluster(Arc::new(OpenShiftCluster))
            .requirements(requirements_met())
            .build();
        assert!(matches!(built, Err(Error::Internal { .. })));
    }

    #[test]
    fn outcome_without_error_or_config_is_internal() {
        let outcome = JoinOutcome {
            cluster_id: "east".into(),
            phase: JoinPhase::Succeeded,
            failed_in: None,
            resolved: None,
            error: None,
        };
        assert!(matches!(outcome.into_result(), Err(Error::Internal { .. })));
    }
}
