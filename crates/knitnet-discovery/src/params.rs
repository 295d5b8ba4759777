//! Read-only heuristics shared by several probes: control-plane command
//! line flags, container environment and flannel's `net-conf.json`.

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use serde::Deserialize;

use knitnet_common::Result;

use crate::introspect::ClusterIntrospection;

const API_SERVER_SELECTOR: &str = "component=kube-apiserver";
const CONTROLLER_MANAGER_SELECTOR: &str = "component=kube-controller-manager";
const KUBE_PROXY_SELECTOR: &str = "k8s-app=kube-proxy";

const SERVICE_RANGE_FLAG: &str = "--service-cluster-ip-range";
const CLUSTER_CIDR_FLAG: &str = "--cluster-cidr";

/// Key holding flannel-style network configuration
pub const NET_CONF_KEY: &str = "net-conf.json";

/// Service range from the API server's command line
pub async fn find_service_cidr(cluster: &dyn ClusterIntrospection) -> Result<Option<String>> {
    find_pod_command_parameter(cluster, API_SERVER_SELECTOR, SERVICE_RANGE_FLAG).await
}

/// Pod range from the controller manager's, then kube-proxy's, command line
pub async fn find_pod_cidr(cluster: &dyn ClusterIntrospection) -> Result<Option<String>> {
    if let Some(cidr) =
        find_pod_command_parameter(cluster, CONTROLLER_MANAGER_SELECTOR, CLUSTER_CIDR_FLAG).await?
    {
        return Ok(Some(cidr));
    }
    find_pod_command_parameter(cluster, KUBE_PROXY_SELECTOR, CLUSTER_CIDR_FLAG).await
}

/// Value of `flag` on the first matching pod that sets it
pub async fn find_pod_command_parameter(
    cluster: &dyn ClusterIntrospection,
    label_selector: &str,
    flag: &str,
) -> Result<Option<String>> {
    let pods = cluster.list_pods(label_selector).await?;
    Ok(pods.iter().find_map(|pod| command_parameter(pod, flag)))
}

/// Value of `flag` in any container's command or args.
///
/// Accepts both `--flag=value` and `--flag value`. Arguments holding a
/// whole shell line (`sh -c "exec kube-apiserver ..."`) are split on
/// whitespace first.
pub fn command_parameter(pod: &Pod, flag: &str) -> Option<String> {
    let prefix = format!("{flag}=");
    let tokens: Vec<&str> = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.command.iter().flatten().chain(c.args.iter().flatten()))
        .flat_map(|arg| arg.split_whitespace())
        .collect();

    tokens
        .iter()
        .enumerate()
        .find_map(|(i, token)| {
            if *token == flag {
                tokens.get(i + 1).map(|v| v.to_string())
            } else {
                token.strip_prefix(&prefix).map(str::to_string)
            }
        })
        .filter(|v| !v.is_empty())
}

/// Value of an environment variable on any container of the pod
pub fn container_env(pod: &Pod, name: &str) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
        .filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
struct NetConf {
    #[serde(rename = "Network")]
    network: Option<String>,
}

/// `Network` field of a flannel-style `net-conf.json` entry
pub fn net_conf_network(config_map: &ConfigMap) -> Option<String> {
    let raw = config_map.data.as_ref()?.get(NET_CONF_KEY)?;
    serde_json::from_str::<NetConf>(raw)
        .ok()?
        .network
        .filter(|n| !n.is_empty())
}


#[cfg(test)]
mod tests {
    use super::test_pods::pod;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parameter_in_equals_form() {
        let p = pod(
            "kube-system",
            &["kube-apiserver", "--service-cluster-ip-range=10.96.0.0/12"],
            &[],
        );
        assert_eq!(
            command_parameter(&p, SERVICE_RANGE_FLAG).as_deref(),
            Some("10.96.0.0/12")
        );
    }

    #[test]
    fn parameter_in_separate_token_form() {
        let p = pod(
            "kube-system",
            &["kube-controller-manager", "--cluster-cidr", "10.244.0.0/16", "--v=2"],
            &[],
        );
        assert_eq!(
            command_parameter(&p, CLUSTER_CIDR_FLAG).as_deref(),
            Some("10.244.0.0/16")
        );
    }

    #[test]
    fn parameter_as_last_token() {
        let p = pod("kube-system", &["--cluster-cidr=10.1.0.0/16"], &[]);
        assert_eq!(
            command_parameter(&p, CLUSTER_CIDR_FLAG).as_deref(),
            Some("10.1.0.0/16")
        );
    }

    #[test]
    fn parameter_inside_shell_line() {
        let p = pod(
            "kube-system",
            &[
                "/bin/sh",
                "-c",
                "exec kube-apiserver --advertise-address=10.0.0.1 --service-cluster-ip-range=10.96.0.0/12 --v=2",
            ],
            &[],
        );
        assert_eq!(
            command_parameter(&p, SERVICE_RANGE_FLAG).as_deref(),
            Some("10.96.0.0/12")
        );

        let p = pod(
            "kube-system",
            &["/bin/sh", "-c", "kube-controller-manager --cluster-cidr 10.244.0.0/16"],
            &[],
        );
        assert_eq!(
            command_parameter(&p, CLUSTER_CIDR_FLAG).as_deref(),
            Some("10.244.0.0/16")
        );
    }

    #[test]
    fn missing_parameter_is_none() {
        let p = pod("kube-system", &["kube-apiserver", "--v=2"], &[]);
        assert_eq!(command_parameter(&p, SERVICE_RANGE_FLAG), None);
        // a prefix of another flag must not match
        let p = pod("kube-system", &["--cluster-cidr-extra=1"], &[]);
        assert_eq!(command_parameter(&p, CLUSTER_CIDR_FLAG), None);
    }

    #[test]
    fn env_lookup_ignores_empty_values() {
        let p = pod("weave", &[], &[("IPALLOC_RANGE", "10.32.0.0/12"), ("EMPTY", "")]);
        assert_eq!(container_env(&p, "IPALLOC_RANGE").as_deref(), Some("10.32.0.0/12"));
        assert_eq!(container_env(&p, "EMPTY"), None);
        assert_eq!(container_env(&p, "MISSING"), None);
    }

    #[test]
    fn net_conf_network_is_extracted() {
        let cm = ConfigMap {
            data: Some(BTreeMap::from([(
                NET_CONF_KEY.to_string(),
                r#"{"Network": "10.244.0.0/16", "Backend": {"Type": "vxlan"}}"#.to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(net_conf_network(&cm).as_deref(), Some("10.244.0.0/16"));

        let broken = ConfigMap {
            data: Some(BTreeMap::from([(NET_CONF_KEY.to_string(), "{".to_string())])),
            ..Default::default()
        };
        assert_eq!(net_conf_network(&broken), None);
    }
}
