//! Generic fallback used when no plugin signature matched.
//!
//! Only the service range can be learnt this way; the pod range stays unknown.

use tracing::{debug, info, warn};

use knitnet_common::Result;

use crate::introspect::{ClusterIntrospection, ProbeServiceOutcome};
use crate::network::{ClusterNetwork, NetworkPlugin};
use crate::params::find_service_cidr;

/// Namespace the transient probe service is created in
pub const PROBE_NAMESPACE: &str = "default";

const VALID_RANGE_MARKER: &str = "valid IPs is ";

/// Infer the service range without knowing the CNI plugin.
///
/// Tries the API server's command line first and only then submits the
/// transient probe service. Returns `None` if neither yields a range.
pub async fn discover_generic(cluster: &dyn ClusterIntrospection) -> Result<Option<ClusterNetwork>> {
    let service_cidr = match find_service_cidr(cluster).await? {
        Some(cidr) => Some(cidr),
        None => service_cidr_from_probe(cluster).await?,
    };

    Ok(service_cidr.map(|cidr| {
        info!(service_cidr = %cidr, "Service range inferred by generic discovery");
        ClusterNetwork::identified(NetworkPlugin::Generic).with_service_cidr(Some(cidr))
    }))
}

async fn service_cidr_from_probe(cluster: &dyn ClusterIntrospection) -> Result<Option<String>> {
    match cluster.create_probe_service(PROBE_NAMESPACE).await? {
        ProbeServiceOutcome::Rejected { message } => {
            let range = parse_service_range(&message);
            if range.is_none() {
                debug!(%message, "Probe service rejection did not name a range");
            }
            Ok(range)
        }
        ProbeServiceOutcome::Created { name, cluster_ip } => {
            warn!(
                service = %name,
                cluster_ip = ?cluster_ip,
                "Probe service was accepted, removing it"
            );
            cluster.delete_probe_service(PROBE_NAMESPACE, &name).await?;
            Ok(None)
        }
    }
}

/// Extract `<CIDR>` from "... The range of valid IPs is <CIDR>"
pub fn parse_service_range(message: &str) -> Option<String> {
    let (_, tail) = message.rsplit_once(VALID_RANGE_MARKER)?;
    tail.split_whitespace()
        .next()
        .map(|cidr| cidr.trim_end_matches(['.', ',', '"']).to_string())
        .filter(|cidr| cidr.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;

    const REJECTION: &str = "Service \"knitnet-cidr-probe\" is invalid: spec.clusterIPs: \
        Invalid value: []string{\"0.0.0.0\"}: failed to allocate IP 0.0.0.0: provided IP is \
        not in the valid range. The range of valid IPs is 10.45.0.0/16";

    #[test]
    fn parses_range_from_rejection() {
        assert_eq!(parse_service_range(REJECTION).as_deref(), Some("10.45.0.0/16"));
    }

    #[test]
    fn unrelated_rejection_yields_nothing() {
        assert_eq!(parse_service_range("forbidden: quota exceeded"), None);
        assert_eq!(parse_service_range("The range of valid IPs is unknown"), None);
    }

    #[tokio::test]
    async fn command_line_wins_over_probe_service() {
        let fixture = Fixture::default()
            .with_api_server("10.96.0.0/12")
            .with_probe_outcome(ProbeServiceOutcome::Rejected {
                message: REJECTION.to_string(),
            });
        let network = discover_generic(&fixture)
            .await
            .expect("discovery runs")
            .expect("range found");
        assert_eq!(network.service_cidrs, vec!["10.96.0.0/12"]);
        assert_eq!(fixture.probe_services_created(), 0);
    }

    #[tokio::test]
    async fn rejected_probe_yields_service_range_only() {
        let fixture = Fixture::default().with_probe_outcome(ProbeServiceOutcome::Rejected {
            message: REJECTION.to_string(),
        });
        let network = discover_generic(&fixture)
            .await
            .expect("discovery runs")
            .expect("range found");
        assert_eq!(network.network_plugin, NetworkPlugin::Generic);
        assert_eq!(network.service_cidrs, vec!["10.45.0.0/16"]);
        assert!(network.pod_cidrs.is_empty());
        assert_eq!(fixture.probe_services_created(), 1);
        assert_eq!(fixture.probe_services_deleted(), 0);
    }

    #[tokio::test]
    async fn accepted_probe_is_always_deleted() {
        let fixture = Fixture::default().with_probe_outcome(ProbeServiceOutcome::Created {
            name: "knitnet-cidr-probe".to_string(),
            cluster_ip: Some("10.96.12.7".to_string()),
        });
        let network = discover_generic(&fixture).await.expect("discovery runs");
        assert_eq!(network, None);
        assert_eq!(fixture.probe_services_deleted(), 1);
    }
}
