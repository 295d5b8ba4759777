//! Downstream registration of a joined cluster
//!
//! The resolved addressing and broker credential are written into a
//! `Submariner` resource that the connectivity operator picks up.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::info;

use knitnet_common::kube_utils::strip_scheme;
use knitnet_common::{Error, Result, FIELD_MANAGER, OPERATOR_NAMESPACE};

use crate::credential::Credential;
use crate::request::ResolvedNetworkConfig;

/// Name of the registration object
pub const SUBMARINER_NAME: &str = "submariner";

/// Hands a resolved configuration to the multi-cluster control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register the cluster; success or failure is the whole contract
    async fn register(&self, resolved: &ResolvedNetworkConfig, credential: &Credential) -> Result<()>;
}

/// `submariner.io/v1alpha1` Submariner resource
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submariner {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: SubmarinerMeta,
    /// Registration payload
    pub spec: SubmarinerSpec,
}

/// Name and namespace of the registration object
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SubmarinerMeta {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

/// Registration payload
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmarinerSpec {
    /// Broker type, always `k8s`
    pub broker: String,
    /// Broker API endpoint without scheme
    pub broker_k8s_api_server: String,
    /// Broker access token
    pub broker_k8s_api_server_token: String,
    /// Base64 broker CA bundle
    #[serde(rename = "brokerK8sCA")]
    pub broker_k8s_ca: String,
    /// Broker namespace holding shared objects
    pub broker_k8s_remote_namespace: String,
    /// Cluster identity
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Only set when configured explicitly
    #[serde(rename = "serviceCIDR", skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    /// Only set when configured explicitly
    #[serde(rename = "clusterCIDR", skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,
    /// Allocated global block
    #[serde(rename = "globalCIDR", skip_serializing_if = "Option::is_none")]
    pub global_cidr: Option<String>,
    /// Namespace the connectivity components run in
    pub namespace: String,
    /// Discovered CNI plugin
    pub network_plugin: String,
}

/// Build the registration object for a cluster.
///
/// Auto-detected ranges are left out so the connectivity operator runs its
/// own discovery and stays in sync with the live cluster.
pub fn submariner_resource(
    resolved: &ResolvedNetworkConfig,
    credential: &Credential,
    broker_api_server: &str,
    broker_namespace: &str,
) -> Submariner {
    let explicit = |cidr: &crate::request::ResolvedCidr| (!cidr.auto_detected).then(|| cidr.cidr.clone());

    Submariner {
        api_version: "submariner.io/v1alpha1".to_string(),
        kind: "Submariner".to_string(),
        metadata: SubmarinerMeta {
            name: SUBMARINER_NAME.to_string(),
            namespace: OPERATOR_NAMESPACE.to_string(),
        },
        spec: SubmarinerSpec {
            broker: "k8s".to_string(),
            broker_k8s_api_server: strip_scheme(broker_api_server).to_string(),
            broker_k8s_api_server_token: credential.token.clone(),
            broker_k8s_ca: STANDARD.encode(&credential.ca),
            broker_k8s_remote_namespace: broker_namespace.to_string(),
            cluster_id: resolved.cluster_id.clone(),
            service_cidr: explicit(&resolved.service_cidr),
            cluster_cidr: explicit(&resolved.cluster_cidr),
            global_cidr: resolved.global_cidr.map(|c| c.to_string()),
            namespace: OPERATOR_NAMESPACE.to_string(),
            network_plugin: resolved.network_plugin.clone(),
        },
    }
}

/// Registers by server-side applying a [`Submariner`] resource
pub struct SubmarinerRegistrar {
    client: Client,
    broker_api_server: String,
    broker_namespace: String,
}

impl SubmarinerRegistrar {
    /// Registrar writing to the cluster `client` points at
    pub fn new(client: Client, broker_api_server: impl Into<String>, broker_namespace: impl Into<String>) -> Self {
        Self {
            client,
            broker_api_server: broker_api_server.into(),
            broker_namespace: broker_namespace.into(),
        }
    }
}

#[async_trait]
impl Registrar for SubmarinerRegistrar {
    async fn register(&self, resolved: &ResolvedNetworkConfig, credential: &Credential) -> Result<()> {
        let resource = submariner_resource(resolved, credential, &self.broker_api_server, &self.broker_namespace);
        let value = serde_json::to_value(&resource)?;

        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("submariner.io", "v1alpha1", "Submariner"));
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), OPERATOR_NAMESPACE, &ar);
        let params = PatchParams::apply(FIELD_MANAGER).force();

        api.patch(SUBMARINER_NAME, &params, &Patch::Apply(&value))
            .await
            .map_err(|e| Error::registration(&resolved.cluster_id, e.to_string()))?;

        info!(
            cluster_id = %resolved.cluster_id,
            global_cidr = ?resolved.global_cidr,
            "Submariner registration applied"
        );
        Ok(())
    }
}
