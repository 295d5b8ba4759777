//! Join inputs and the resolved network configuration handed to registration

use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{debug, warn};

use knitnet_common::crd::{validate_cluster_id, JoinConfig};
use knitnet_common::{Error, Result};
use knitnet_discovery::{ClusterNetwork, NetworkPlugin};

/// Per-attempt input to the join workflow
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinRequest {
    /// DNS-1123 label identifying the cluster
    pub cluster_id: String,
    /// Service CIDR override; `None` means auto-detect
    pub explicit_service_cidr: Option<String>,
    /// Pod CIDR override; `None` means auto-detect
    pub explicit_cluster_cidr: Option<String>,
    /// Global block to claim instead of drawing one
    pub explicit_global_cidr: Option<String>,
    /// Overrides the ledger's default block size
    pub requested_block_size: Option<u64>,
}

impl JoinRequest {
    /// A request that auto-detects everything
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    /// Check the cluster ID and that every explicit CIDR parses
    pub fn validate(&self) -> Result<()> {
        validate_cluster_id(&self.cluster_id)?;
        for (field, cidr) in [
            ("serviceCIDR", &self.explicit_service_cidr),
            ("clusterCIDR", &self.explicit_cluster_cidr),
            ("globalnetCIDR", &self.explicit_global_cidr),
        ] {
            if let Some(cidr) = cidr {
                cidr.trim().parse::<ipnet::IpNet>().map_err(|e| {
                    Error::malformed(field, format!("{cidr:?} is not a CIDR: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

impl From<&JoinConfig> for JoinRequest {
    fn from(config: &JoinConfig) -> Self {
        let set = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        Self {
            cluster_id: config.cluster_id.clone(),
            explicit_service_cidr: set(&config.service_cidr),
            explicit_cluster_cidr: set(&config.cluster_cidr),
            explicit_global_cidr: set(&config.globalnet_cidr),
            requested_block_size: config.globalnet_cluster_size,
        }
    }
}

/// A CIDR plus where it came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCidr {
    /// The CIDR in use
    pub cidr: String,
    /// True if discovery supplied it rather than configuration
    pub auto_detected: bool,
}

/// Everything downstream registration needs to know about addressing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedNetworkConfig {
    /// Cluster being joined
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Service range
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: ResolvedCidr,
    /// Pod range
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: ResolvedCidr,
    /// Global block, absent when global addressing is disabled
    #[serde(rename = "globalCIDR", skip_serializing_if = "Option::is_none")]
    pub global_cidr: Option<Ipv4Net>,
    /// Discovered CNI plugin
    pub network_plugin: String,
}

/// Pick the CIDR to use for `kind` ("service" or "cluster").
///
/// An explicit value always wins; a disagreeing discovered value is only
/// logged. Without either the attempt cannot continue.
pub fn resolve_cidr(kind: &str, explicit: Option<&str>, discovered: &[String]) -> Result<ResolvedCidr> {
    let explicit = explicit.map(str::trim).filter(|c| !c.is_empty());
    let detected = discovered.first();

    match (explicit, detected) {
        (Some(cidr), Some(found)) if found != cidr => {
            warn!(
                kind,
                configured = cidr,
                discovered = %found,
                "Configured CIDR differs from the discovered one, using the configured value"
            );
            Ok(ResolvedCidr {
                cidr: cidr.to_string(),
                auto_detected: false,
            })
        }
        (Some(cidr), _) => Ok(ResolvedCidr {
            cidr: cidr.to_string(),
            auto_detected: false,
        }),
        (None, Some(found)) => {
            debug!(kind, cidr = %found, "Using discovered CIDR");
            Ok(ResolvedCidr {
                cidr: found.clone(),
                auto_detected: true,
            })
        }
        (None, None) => Err(Error::NoCidrFound {
            kind: kind.to_string(),
        }),
    }
}

/// Resolve service and pod ranges for a request against what discovery found
pub fn resolve_network(request: &JoinRequest, network: Option<&ClusterNetwork>) -> Result<ResolvedNetworkConfig> {
    let (pods, services, plugin) = match network {
        Some(n) => (
            n.pod_cidrs.as_slice(),
            n.service_cidrs.as_slice(),
            n.network_plugin.to_string(),
        ),
        None => (&[][..], &[][..], NetworkPlugin::Generic.to_string()),
    };

    Ok(ResolvedNetworkConfig {
        cluster_id: request.cluster_id.clone(),
        service_cidr: resolve_cidr("service", request.explicit_service_cidr.as_deref(), services)?,
        cluster_cidr: resolve_cidr("cluster", request.explicit_cluster_cidr.as_deref(), pods)?,
        global_cidr: None,
        network_plugin: plugin,
    })
}
