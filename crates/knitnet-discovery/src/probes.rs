//! CNI plugin probes
//!
//! Each [`Probe`] is a signature check (is the plugin's marker object
//! present?) plus an extraction step that reads its address ranges. Probes
//! are tried in [`PROBE_ORDER`]; adding a plugin means adding a variant and
//! listing it there.

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use serde_json::Value;
use tracing::debug;

use knitnet_common::Result;

use crate::introspect::ClusterIntrospection;
use crate::network::{ClusterNetwork, NetworkPlugin};
use crate::params::{container_env, find_pod_cidr, find_service_cidr, net_conf_network};

const KUBE_SYSTEM: &str = "kube-system";

const WEAVE_SELECTOR: &str = "name=weave-net";
const WEAVE_IPALLOC_RANGE: &str = "IPALLOC_RANGE";

const CANAL_CONFIG_MAP: &str = "canal-config";
const FLANNEL_CONFIG_MAP: &str = "kube-flannel-cfg";
const CALICO_CONFIG_MAP: &str = "calico-config";

const OVN_DB_SELECTOR: &str = "name=ovnkube-db";
const OVN_DB_SERVICE: &str = "ovnkube-db";
const OVN_CONFIG_MAP: &str = "ovn-config";
const OVN_SSL_ENABLE: &str = "OVN_SSL_ENABLE";
const OVN_NB_PORT: u16 = 6641;
const OVN_SB_PORT: u16 = 6642;

/// Plugin setting: OVN northbound database endpoint
pub const OVN_NBDB: &str = "OVN_NBDB";
/// Plugin setting: OVN southbound database endpoint
pub const OVN_SBDB: &str = "OVN_SBDB";

/// A plugin-specific probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// OpenShift's cluster network configuration object
    OpenShift,
    /// Weave Net daemonset pods
    WeaveNet,
    /// Canal configuration
    CanalFlannel,
    /// OVN-Kubernetes database pods
    OvnKubernetes,
    /// Flannel configuration
    Flannel,
    /// Calico configuration
    Calico,
}

/// Fixed priority order in which probes are tried
pub const PROBE_ORDER: [Probe; 6] = [
    Probe::OpenShift,
    Probe::WeaveNet,
    Probe::CanalFlannel,
    Probe::OvnKubernetes,
    Probe::Flannel,
    Probe::Calico,
];

/// The marker object a probe matched on
#[derive(Clone, Debug)]
pub enum Signature {
    /// A configuration object
    ConfigMap(ConfigMap),
    /// A plugin workload
    Pod(Pod),
    /// A cluster-scoped network configuration document
    NetworkConfig(Value),
}

impl Probe {
    /// Name used in logs and discovery errors
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenShift => "openshift",
            Self::WeaveNet => "weave-net",
            Self::CanalFlannel => "canal-flannel",
            Self::OvnKubernetes => "ovn-kubernetes",
            Self::Flannel => "flannel",
            Self::Calico => "calico",
        }
    }

    /// Plugin reported when the signature matched but extraction found nothing
    pub fn plugin(self) -> NetworkPlugin {
        match self {
            Self::OpenShift => NetworkPlugin::OpenShiftSdn,
            Self::WeaveNet => NetworkPlugin::WeaveNet,
            Self::CanalFlannel => NetworkPlugin::CanalFlannel,
            Self::OvnKubernetes => NetworkPlugin::OvnKubernetes,
            Self::Flannel => NetworkPlugin::Flannel,
            Self::Calico => NetworkPlugin::Calico,
        }
    }

    /// Look for the plugin's marker object
    pub async fn signature(self, cluster: &dyn ClusterIntrospection) -> Result<Option<Signature>> {
        match self {
            Self::OpenShift => Ok(cluster
                .get_openshift_network()
                .await?
                .map(Signature::NetworkConfig)),
            Self::WeaveNet => first_pod(cluster, WEAVE_SELECTOR).await,
            Self::CanalFlannel => config_map(cluster, KUBE_SYSTEM, CANAL_CONFIG_MAP).await,
            Self::OvnKubernetes => first_pod(cluster, OVN_DB_SELECTOR).await,
            Self::Flannel => config_map(cluster, KUBE_SYSTEM, FLANNEL_CONFIG_MAP).await,
            Self::Calico => config_map(cluster, KUBE_SYSTEM, CALICO_CONFIG_MAP).await,
        }
    }

    /// Read the plugin's address ranges given its matched signature
    pub async fn extract(
        self,
        cluster: &dyn ClusterIntrospection,
        signature: Signature,
    ) -> Result<ClusterNetwork> {
        let network = match (self, signature) {
            (Self::OpenShift, Signature::NetworkConfig(doc)) => openshift_network(&doc),
            (Self::WeaveNet, Signature::Pod(pod)) => ClusterNetwork::identified(self.plugin())
                .with_pod_cidr(container_env(&pod, WEAVE_IPALLOC_RANGE))
                .with_service_cidr(find_service_cidr(cluster).await?),
            (Self::CanalFlannel | Self::Flannel, Signature::ConfigMap(cm)) => {
                ClusterNetwork::identified(self.plugin())
                    .with_pod_cidr(net_conf_network(&cm))
                    .with_service_cidr(find_service_cidr(cluster).await?)
            }
            (Self::OvnKubernetes, Signature::Pod(pod)) => ovn_network(cluster, &pod).await?,
            (Self::Calico, Signature::ConfigMap(_)) => ClusterNetwork::identified(self.plugin())
                .with_pod_cidr(find_pod_cidr(cluster).await?)
                .with_service_cidr(find_service_cidr(cluster).await?),
            (probe, _) => ClusterNetwork::identified(probe.plugin()),
        };
        Ok(network)
    }

    /// Signature check followed by extraction; `None` if the plugin is absent
    pub async fn detect(self, cluster: &dyn ClusterIntrospection) -> Result<Option<ClusterNetwork>> {
        match self.signature(cluster).await? {
            Some(signature) => {
                debug!(probe = self.name(), "Signature found");
                self.extract(cluster, signature).await.map(Some)
            }
            None => Ok(None),
        }
    }
}

async fn first_pod(
    cluster: &dyn ClusterIntrospection,
    label_selector: &str,
) -> Result<Option<Signature>> {
    let pods = cluster.list_pods(label_selector).await?;
    Ok(pods.into_iter().next().map(Signature::Pod))
}

async fn config_map(
    cluster: &dyn ClusterIntrospection,
    namespace: &str,
    name: &str,
) -> Result<Option<Signature>> {
    Ok(cluster
        .get_config_map(namespace, name)
        .await?
        .map(Signature::ConfigMap))
}

fn openshift_network(doc: &Value) -> ClusterNetwork {
    let spec = &doc["spec"];
    let plugin = match spec["networkType"].as_str() {
        Some("OVNKubernetes") => NetworkPlugin::OvnKubernetes,
        _ => NetworkPlugin::OpenShiftSdn,
    };

    let mut network = ClusterNetwork::identified(plugin);
    network.pod_cidrs = spec["clusterNetwork"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry["cidr"].as_str().map(str::to_string))
        .collect();
    network.service_cidrs = spec["serviceNetwork"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|cidr| cidr.as_str().map(str::to_string))
        .collect();
    network
}

async fn ovn_network(cluster: &dyn ClusterIntrospection, db_pod: &Pod) -> Result<ClusterNetwork> {
    let mut network = ClusterNetwork::identified(NetworkPlugin::OvnKubernetes);
    let Some(namespace) = db_pod.metadata.namespace.as_deref() else {
        return Ok(network);
    };

    if cluster.get_service(namespace, OVN_DB_SERVICE).await?.is_none() {
        debug!(namespace, "OVN database pod found without its service");
        return Ok(network);
    }

    // Plain TCP unless the database pod opts into SSL
    let proto = match container_env(db_pod, OVN_SSL_ENABLE) {
        Some(v) if !v.eq_ignore_ascii_case("no") => "ssl",
        _ => "tcp",
    };
    network = network
        .with_setting(
            OVN_NBDB,
            format!("{proto}:{OVN_DB_SERVICE}.{namespace}:{OVN_NB_PORT}"),
        )
        .with_setting(
            OVN_SBDB,
            format!("{proto}:{OVN_DB_SERVICE}.{namespace}:{OVN_SB_PORT}"),
        );

    if let Some(data) = cluster
        .get_config_map(namespace, OVN_CONFIG_MAP)
        .await?
        .and_then(|cm| cm.data)
    {
        network = network
            .with_pod_cidr(data.get("net_cidr").cloned())
            .with_service_cidr(data.get("svc_cidr").cloned());
    }

    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;
    use crate::params::test_pods::pod;

    #[test]
    fn order_is_fixed() {
        let names: Vec<_> = PROBE_ORDER.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            [
                "openshift",
                "weave-net",
                "canal-flannel",
                "ovn-kubernetes",
                "flannel",
                "calico"
            ]
        );
    }

    #[test]
    fn openshift_document_is_parsed() {
        let doc = serde_json::json!({
            "spec": {
                "networkType": "OpenShiftSDN",
                "clusterNetwork": [{"cidr": "10.128.0.0/14", "hostPrefix": 23}],
                "serviceNetwork": ["172.30.0.0/16"]
            }
        });
        let network = openshift_network(&doc);
        assert_eq!(network.network_plugin, NetworkPlugin::OpenShiftSdn);
        assert_eq!(network.pod_cidrs, vec!["10.128.0.0/14"]);
        assert_eq!(network.service_cidrs, vec!["172.30.0.0/16"]);

        let ovn = openshift_network(&serde_json::json!({"spec": {"networkType": "OVNKubernetes"}}));
        assert_eq!(ovn.network_plugin, NetworkPlugin::OvnKubernetes);
        assert!(ovn.pod_cidrs.is_empty());
    }

    #[tokio::test]
    async fn weave_reads_ipalloc_range() {
        let fixture = Fixture::default()
            .with_pod(
                WEAVE_SELECTOR,
                pod("kube-system", &["/home/weave/launch.sh"], &[(WEAVE_IPALLOC_RANGE, "10.32.0.0/12")]),
            )
            .with_api_server("10.96.0.0/12");
        let network = Probe::WeaveNet
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("weave detected");
        assert_eq!(network.network_plugin, NetworkPlugin::WeaveNet);
        assert_eq!(network.pod_cidrs, vec!["10.32.0.0/12"]);
        assert_eq!(network.service_cidrs, vec!["10.96.0.0/12"]);
    }

    #[tokio::test]
    async fn signature_without_cidrs_still_identifies_plugin() {
        let fixture = Fixture::default().with_config_map(KUBE_SYSTEM, CANAL_CONFIG_MAP, &[]);
        let network = Probe::CanalFlannel
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("canal detected");
        assert_eq!(network, ClusterNetwork::identified(NetworkPlugin::CanalFlannel));
    }

    #[tokio::test]
    async fn absent_signature_is_not_an_error() {
        let fixture = Fixture::default();
        for probe in PROBE_ORDER {
            assert_eq!(probe.detect(&fixture).await.expect("probe runs"), None);
        }
    }

    #[tokio::test]
    async fn ovn_builds_database_endpoints() {
        let fixture = Fixture::default()
            .with_pod(OVN_DB_SELECTOR, pod("ovn-kubernetes", &["ovnkube"], &[]))
            .with_service("ovn-kubernetes", OVN_DB_SERVICE)
            .with_config_map(
                "ovn-kubernetes",
                OVN_CONFIG_MAP,
                &[("net_cidr", "10.128.0.0/14"), ("svc_cidr", "172.30.0.0/16")],
            );
        let network = Probe::OvnKubernetes
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("ovn detected");
        assert_eq!(
            network.plugin_settings.get(OVN_NBDB).map(String::as_str),
            Some("tcp:ovnkube-db.ovn-kubernetes:6641")
        );
        assert_eq!(
            network.plugin_settings.get(OVN_SBDB).map(String::as_str),
            Some("tcp:ovnkube-db.ovn-kubernetes:6642")
        );
        assert_eq!(network.pod_cidrs, vec!["10.128.0.0/14"]);
        assert_eq!(network.service_cidrs, vec!["172.30.0.0/16"]);
    }

    #[tokio::test]
    async fn ovn_without_ssl_uses_tcp() {
        let fixture = Fixture::default()
            .with_pod(
                OVN_DB_SELECTOR,
                pod("ovn-kubernetes", &["ovnkube"], &[(OVN_SSL_ENABLE, "NO")]),
            )
            .with_service("ovn-kubernetes", OVN_DB_SERVICE);
        let network = Probe::OvnKubernetes
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("ovn detected");
        assert_eq!(
            network.plugin_settings.get(OVN_NBDB).map(String::as_str),
            Some("tcp:ovnkube-db.ovn-kubernetes:6641")
        );
    }

    #[tokio::test]
    async fn ovn_with_ssl_enabled_uses_ssl() {
        let fixture = Fixture::default()
            .with_pod(
                OVN_DB_SELECTOR,
                pod("ovn-kubernetes", &["ovnkube"], &[(OVN_SSL_ENABLE, "yes")]),
            )
            .with_service("ovn-kubernetes", OVN_DB_SERVICE);
        let network = Probe::OvnKubernetes
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("ovn detected");
        assert_eq!(
            network.plugin_settings.get(OVN_NBDB).map(String::as_str),
            Some("ssl:ovnkube-db.ovn-kubernetes:6641")
        );
        assert_eq!(
            network.plugin_settings.get(OVN_SBDB).map(String::as_str),
            Some("ssl:ovnkube-db.ovn-kubernetes:6642")
        );
    }

    #[tokio::test]
    async fn calico_uses_control_plane_flags() {
        let fixture = Fixture::default()
            .with_config_map(KUBE_SYSTEM, CALICO_CONFIG_MAP, &[])
            .with_pod(
                "k8s-app=kube-proxy",
                pod("kube-system", &["kube-proxy", "--cluster-cidr=192.168.0.0/16"], &[]),
            )
            .with_api_server("10.96.0.0/12");
        let network = Probe::Calico
            .detect(&fixture)
            .await
            .expect("probe runs")
            .expect("calico detected");
        assert_eq!(network.pod_cidrs, vec!["192.168.0.0/16"]);
        assert_eq!(network.service_cidrs, vec!["10.96.0.0/12"]);
    }
}
