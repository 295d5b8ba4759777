//! Gateway node selection
//!
//! Tunnel endpoints run on nodes labelled `submariner.io/gateway=true`. A
//! joining cluster without such a node gets one labelled automatically:
//! the first worker, or failing that the first node that is not a master.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use knitnet_common::retry::{wait_with_backoff, Backoff};
use knitnet_common::{Error, Result, FIELD_MANAGER};

/// Label marking a node as tunnel gateway
pub const GATEWAY_LABEL: &str = "submariner.io/gateway";
/// Role label carried by worker nodes
pub const WORKER_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";
/// Role label carried by control-plane nodes
pub const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";

/// What to do about the gateway label
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayChoice {
    /// A node already carries the label
    AlreadyLabeled(String),
    /// This node should be labelled
    Label(String),
    /// No node qualifies
    NoCandidate,
}

/// Decide which node, if any, to label as gateway
pub fn select_gateway(nodes: &[Node]) -> GatewayChoice {
    fn has_label(node: &Node, key: &str) -> bool {
        node.labels().contains_key(key)
    }

    if let Some(node) = nodes
        .iter()
        .find(|n| n.labels().get(GATEWAY_LABEL).is_some_and(|v| v == "true"))
    {
        return GatewayChoice::AlreadyLabeled(node.name_any());
    }

    nodes
        .iter()
        .find(|n| has_label(n, WORKER_ROLE_LABEL))
        .or_else(|| nodes.iter().find(|n| !has_label(n, MASTER_ROLE_LABEL)))
        .map(|n| GatewayChoice::Label(n.name_any()))
        .unwrap_or(GatewayChoice::NoCandidate)
}

fn gateway_patch() -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "labels": { (GATEWAY_LABEL): "true" }
        }
    })
}

/// Ensure some node carries the gateway label.
///
/// Returns the name of the node that was labelled by this call, `None` if
/// one already was or no node qualifies. Conflicting patches are retried
/// under [`Backoff::node_label`].
pub async fn ensure_gateway(client: &Client) -> Result<Option<String>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;

    let name = match select_gateway(&list.items) {
        GatewayChoice::AlreadyLabeled(name) => {
            debug!(node = %name, "Gateway node already labeled");
            return Ok(None);
        }
        GatewayChoice::NoCandidate => {
            warn!(nodes = list.items.len(), "No node qualifies as gateway");
            return Ok(None);
        }
        GatewayChoice::Label(name) => name,
    };

    let patch = gateway_patch();
    let params = PatchParams::apply(FIELD_MANAGER);
    let operation = format!("label gateway node {name}");
    let (api, node_name, params, patch) = (&nodes, name.as_str(), &params, &patch);
    wait_with_backoff(&Backoff::node_label(), &operation, move || async move {
        match api.patch(node_name, params, &Patch::Merge(patch)).await {
            Ok(_) => Ok(Some(())),
            Err(e) => {
                let err = Error::from(e);
                if err.is_conflict() {
                    debug!(node = %node_name, "Node changed while labeling, retrying");
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    })
    .await?;

    info!(node = %name, "Labeled gateway node");
    Ok(Some(name))
}
