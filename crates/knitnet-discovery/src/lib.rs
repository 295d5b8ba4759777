//! Cluster network discovery
//!
//! Infers which CNI plugin a cluster runs and its native pod/service CIDRs
//! by probing for well-known marker objects. Probes are read-only; only the
//! generic fallback creates (and removes) a transient service.

#![deny(missing_docs)]

pub mod generic;
pub mod introspect;
pub mod network;
pub mod params;
pub mod probes;

#[cfg(test)]
mod fixture;

use tracing::{debug, info, instrument};

use knitnet_common::{Error, Result};

pub use introspect::{ClusterIntrospection, KubeIntrospection, ProbeServiceOutcome};
pub use network::{ClusterNetwork, NetworkPlugin};
pub use probes::{Probe, PROBE_ORDER};

/// Discover the cluster's network.
///
/// The first probe in [`PROBE_ORDER`] whose signature matches wins. If none
/// matches, [`generic::discover_generic`] is tried. API failures abort
/// discovery with [`Error::Discovery`] naming the probe that was running.
#[instrument(skip(cluster))]
pub async fn discover(cluster: &dyn ClusterIntrospection) -> Result<Option<ClusterNetwork>> {
    for probe in PROBE_ORDER {
        let detected = probe
            .detect(cluster)
            .await
            .map_err(|e| Error::discovery(probe.name(), e))?;

        match detected {
            Some(network) => {
                info!(probe = probe.name(), %network, "Network plugin detected");
                return Ok(Some(network));
            }
            None => debug!(probe = probe.name(), "Plugin not present"),
        }
    }

    let network = generic::discover_generic(cluster)
        .await
        .map_err(|e| Error::discovery("generic", e))?;
    if network.is_none() {
        info!("No network plugin or service range could be discovered");
    }
    Ok(network)
}
