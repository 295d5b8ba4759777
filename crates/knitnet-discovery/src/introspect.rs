//! Read access to the cluster being discovered
//!
//! Probes only ever see [`ClusterIntrospection`]. Lookups that find nothing
//! return `None`/empty rather than an error; an `Err` always means the API
//! itself failed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service, ServicePort, ServiceSpec};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{GroupVersionKind, ObjectMeta};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use knitnet_common::Result;

/// Name of the transient service used to learn the service range
pub const PROBE_SERVICE_NAME: &str = "knitnet-cidr-probe";

/// Address no service range can contain; the API server rejects it and
/// reports the valid range in the error text.
const PROBE_CLUSTER_IP: &str = "0.0.0.0";

/// What happened when the probe service was submitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeServiceOutcome {
    /// The API server refused the object with this message
    Rejected {
        /// Server-provided rejection text
        message: String,
    },
    /// The object was created and must be deleted by the caller
    Created {
        /// Name of the created object
        name: String,
        /// Cluster IP the server assigned, if any
        cluster_ip: Option<String>,
    },
}

/// Cluster introspection used by network probes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterIntrospection: Send + Sync {
    /// Get a ConfigMap, `None` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// List pods in all namespaces matching a label selector
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Get a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// The OpenShift cluster network configuration object, if the cluster has one
    async fn get_openshift_network(&self) -> Result<Option<serde_json::Value>>;

    /// Submit the transient probe service
    async fn create_probe_service(&self, namespace: &str) -> Result<ProbeServiceOutcome>;

    /// Delete the transient probe service
    async fn delete_probe_service(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterIntrospection`] over a live API server
#[derive(Clone)]
pub struct KubeIntrospection {
    client: Client,
}

impl KubeIntrospection {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterIntrospection for KubeIntrospection {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_openshift_network(&self) -> Result<Option<serde_json::Value>> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Network");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        // Clusters without the OpenShift API answer 404, which get_opt maps to None
        Ok(api.get_opt("cluster").await?.map(|obj| obj.data))
    }

    async fn create_probe_service(&self, namespace: &str) -> Result<ProbeServiceOutcome> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let probe = Service {
            metadata: ObjectMeta {
                name: Some(PROBE_SERVICE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(PROBE_CLUSTER_IP.to_string()),
                ports: Some(vec![ServicePort {
                    port: 443,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &probe).await {
            Ok(created) => Ok(ProbeServiceOutcome::Created {
                name: PROBE_SERVICE_NAME.to_string(),
                cluster_ip: created.spec.and_then(|s| s.cluster_ip),
            }),
            Err(kube::Error::Api(ae)) if ae.code == 422 || ae.code == 400 => {
                debug!(code = ae.code, "Probe service rejected");
                Ok(ProbeServiceOutcome::Rejected {
                    message: ae.message,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_probe_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
