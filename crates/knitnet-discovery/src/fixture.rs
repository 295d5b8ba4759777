//! In-memory cluster used by discovery tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::core::ObjectMeta;

use knitnet_common::Result;

use crate::introspect::{ClusterIntrospection, ProbeServiceOutcome};
use crate::params::test_pods::pod;

#[derive(Default)]
pub struct Fixture {
    config_maps: BTreeMap<(String, String), ConfigMap>,
    pods: BTreeMap<String, Vec<Pod>>,
    services: BTreeMap<(String, String), Service>,
    openshift_network: Option<serde_json::Value>,
    probe_outcome: Option<ProbeServiceOutcome>,
    probes_created: AtomicU32,
    probes_deleted: AtomicU32,
}

impl Fixture {
    pub fn with_config_map(mut self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.config_maps
            .insert((namespace.to_string(), name.to_string()), cm);
        self
    }

    pub fn with_pod(mut self, label_selector: &str, pod: Pod) -> Self {
        self.pods
            .entry(label_selector.to_string())
            .or_default()
            .push(pod);
        self
    }

    pub fn with_api_server(self, service_range: &str) -> Self {
        let flag = format!("--service-cluster-ip-range={service_range}");
        self.with_pod(
            "component=kube-apiserver",
            pod("kube-system", &["kube-apiserver", &flag], &[]),
        )
    }

    pub fn with_service(mut self, namespace: &str, name: &str) -> Self {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.services
            .insert((namespace.to_string(), name.to_string()), svc);
        self
    }

    pub fn with_openshift_network(mut self, doc: serde_json::Value) -> Self {
        self.openshift_network = Some(doc);
        self
    }

    pub fn with_probe_outcome(mut self, outcome: ProbeServiceOutcome) -> Self {
        self.probe_outcome = Some(outcome);
        self
    }

    pub fn probe_services_created(&self) -> u32 {
        self.probes_created.load(Ordering::SeqCst)
    }

    pub fn probe_services_deleted(&self) -> u32 {
        self.probes_deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterIntrospection for Fixture {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self.pods.get(label_selector).cloned().unwrap_or_default())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_openshift_network(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.openshift_network.clone())
    }

    async fn create_probe_service(&self, _namespace: &str) -> Result<ProbeServiceOutcome> {
        self.probes_created.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .probe_outcome
            .clone()
            .unwrap_or(ProbeServiceOutcome::Rejected {
                message: "forbidden".to_string(),
            }))
    }

    async fn delete_probe_service(&self, _namespace: &str, _name: &str) -> Result<()> {
        self.probes_deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
