//! Discovered facts about one cluster's networking

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// CNI plugin providing a cluster's native pod networking
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkPlugin {
    /// No specific plugin identified
    #[serde(rename = "generic")]
    Generic,
    /// Flannel
    #[serde(rename = "flannel")]
    Flannel,
    /// Weave Net
    #[serde(rename = "weave-net")]
    WeaveNet,
    /// Calico
    #[serde(rename = "calico")]
    Calico,
    /// OVN-Kubernetes
    #[serde(rename = "OVNKubernetes")]
    OvnKubernetes,
    /// OpenShift SDN
    #[serde(rename = "OpenShiftSDN")]
    OpenShiftSdn,
    /// Canal (Calico policy over Flannel)
    #[serde(rename = "canal-flannel")]
    CanalFlannel,
}

impl NetworkPlugin {
    /// Name understood by the downstream registration payload
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Flannel => "flannel",
            Self::WeaveNet => "weave-net",
            Self::Calico => "calico",
            Self::OvnKubernetes => "OVNKubernetes",
            Self::OpenShiftSdn => "OpenShiftSDN",
            Self::CanalFlannel => "canal-flannel",
        }
    }
}

impl std::fmt::Display for NetworkPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one discovery call. Built once and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNetwork {
    /// Plugin whose signature matched
    pub network_plugin: NetworkPlugin,
    /// Pod CIDRs in discovery order
    pub pod_cidrs: Vec<String>,
    /// Service CIDRs in discovery order
    pub service_cidrs: Vec<String>,
    /// Plugin-specific settings (e.g. OVN database endpoints)
    pub plugin_settings: BTreeMap<String, String>,
}

impl ClusterNetwork {
    /// A plugin was identified but nothing could be extracted
    pub fn identified(network_plugin: NetworkPlugin) -> Self {
        Self {
            network_plugin,
            pod_cidrs: Vec::new(),
            service_cidrs: Vec::new(),
            plugin_settings: BTreeMap::new(),
        }
    }

    /// Builder-style pod CIDR, skipped when absent
    pub fn with_pod_cidr(mut self, cidr: Option<String>) -> Self {
        self.pod_cidrs.extend(cidr);
        self
    }

    /// Builder-style service CIDR, skipped when absent
    pub fn with_service_cidr(mut self, cidr: Option<String>) -> Self {
        self.service_cidrs.extend(cidr);
        self
    }

    /// Builder-style plugin setting
    pub fn with_setting(mut self, key: &str, value: impl Into<String>) -> Self {
        self.plugin_settings.insert(key.to_string(), value.into());
        self
    }
}

impl std::fmt::Display for ClusterNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "plugin={} pods=[{}] services=[{}]",
            self.network_plugin,
            self.pod_cidrs.join(","),
            self.service_cidrs.join(",")
        )
    }
}
