//! Knitnet Custom Resource Definition
//!
//! A Knitnet describes what this cluster contributes to the multi-cluster
//! overlay: hosting the broker domain, joining one, or both. Its status is a
//! single phase; per-attempt detail is published as Events.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::validate_cluster_id;
use crate::{DEFAULT_GLOBALNET_CIDR_RANGE, DEFAULT_GLOBALNET_CLUSTER_SIZE};

/// Specification for a Knitnet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.tkestack.io",
    version = "v1alpha1",
    kind = "Knitnet",
    plural = "knitnets",
    shortname = "kn",
    status = "KnitnetStatus",
    namespaced,
    printcolumn = r#"{"name":"Action","type":"string","jsonPath":".spec.action"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KnitnetSpec {
    /// What this cluster does in the broker domain
    #[serde(default)]
    pub action: KnitnetAction,

    /// Broker-domain settings, including global addressing
    #[serde(default)]
    pub broker_config: BrokerConfig,

    /// Per-cluster join settings; required for `join` and `all`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_config: Option<JoinConfig>,
}

impl KnitnetSpec {
    /// Reject an unusable resource before any side effect is attempted
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.broker_config.default_globalnet_cluster_size == 0 {
            return Err(crate::Error::malformed(
                "brokerConfig.defaultGlobalnetClusterSize",
                "must be greater than zero",
            ));
        }

        if self.action.joins() {
            let join = self.join_config.as_ref().ok_or_else(|| {
                crate::Error::malformed("joinConfig", format!("required for action {}", self.action))
            })?;
            validate_cluster_id(&join.cluster_id)?;
        }

        Ok(())
    }
}

/// Role of this cluster in the broker domain
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KnitnetAction {
    /// Host the broker domain (and its globalnet ledger)
    Broker,
    /// Join an existing broker domain
    Join,
    /// Host the broker domain and join it
    #[default]
    All,
}

impl KnitnetAction {
    /// True if this action hosts the broker domain
    pub fn deploys_broker(&self) -> bool {
        matches!(self, Self::Broker | Self::All)
    }

    /// True if this action joins the broker domain
    pub fn joins(&self) -> bool {
        matches!(self, Self::Join | Self::All)
    }
}

impl std::fmt::Display for KnitnetAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Join => write!(f, "join"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Broker-domain configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Whether tunnel connectivity is deployed (gateway labeling depends on it)
    #[serde(default = "default_true")]
    pub connectivity_enabled: bool,

    /// Enable global addressing for overlapping cluster CIDRs
    #[serde(default)]
    pub globalnet_enable: bool,

    /// Supernet subdivided among joining clusters
    #[serde(default = "default_globalnet_cidr_range")]
    pub globalnet_cidr_range: String,

    /// Default number of global addresses per cluster
    #[serde(default = "default_globalnet_cluster_size")]
    pub default_globalnet_cluster_size: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connectivity_enabled: true,
            globalnet_enable: false,
            globalnet_cidr_range: default_globalnet_cidr_range(),
            default_globalnet_cluster_size: default_globalnet_cluster_size(),
        }
    }
}

/// Per-cluster join configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    /// Unique DNS-1123 style identity of this cluster in the broker domain
    #[serde(rename = "clusterID")]
    pub cluster_id: String,

    /// Service CIDR override; empty means auto-detect
    #[serde(default, rename = "serviceCIDR", skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    /// Pod CIDR override; empty means auto-detect
    #[serde(default, rename = "clusterCIDR", skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,

    /// Explicit global CIDR for this cluster
    #[serde(default, rename = "globalnetCIDR", skip_serializing_if = "Option::is_none")]
    pub globalnet_cidr: Option<String>,

    /// Override of the broker's default block size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globalnet_cluster_size: Option<u64>,

    /// Label a worker node as the gateway when none is labeled yet
    #[serde(default = "default_true")]
    pub label_gateway: bool,
}

/// Knitnet lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum KnitnetPhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Last attempt succeeded
    Running,
    /// Last attempt failed; see Events for detail
    Failed,
}

impl std::fmt::Display for KnitnetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for a Knitnet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnitnetStatus {
    /// Outcome of the last attempt
    #[serde(default)]
    pub phase: KnitnetPhase,

    /// When the phase last changed (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_globalnet_cidr_range() -> String {
    DEFAULT_GLOBALNET_CIDR_RANGE.to_string()
}

fn default_globalnet_cluster_size() -> u64 {
    DEFAULT_GLOBALNET_CLUSTER_SIZE
}
