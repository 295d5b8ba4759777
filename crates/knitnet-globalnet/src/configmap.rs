//! Ledger backed by a ConfigMap on the broker cluster.
//!
//! Uses resourceVersion for compare-and-swap semantics:
//! - Read the ConfigMap and its resourceVersion
//! - Replace with that resourceVersion; the API server answers 409 if the
//!   object changed since the read
//! - Only the ledger keys are overwritten; other keys and metadata stay

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tracing::{debug, info};

use knitnet_common::{Error, Result};

use crate::ledger::{Version, VersionedLedger};
use crate::record::{GlobalAllocationRecord, GLOBALNET_COMPONENT_LABEL, GLOBALNET_CONFIG_MAP};

/// [`VersionedLedger`] stored in `submariner-globalnet-info`
pub struct ConfigMapLedger {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapLedger {
    /// Ledger in the broker namespace of the cluster `client` points at
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: GLOBALNET_CONFIG_MAP.to_string(),
        }
    }

    fn config_map(&self, data: BTreeMap<String, String>) -> ConfigMap {
        let (label_key, label_value) = GLOBALNET_COMPONENT_LABEL;
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    label_key.to_string(),
                    label_value.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Overlay the ledger keys onto the stored object.
///
/// Labels, annotations and data keys owned by others survive the replace;
/// `resourceVersion` is pinned to the version the record was decided on.
fn overlay_ledger(mut stored: ConfigMap, data: BTreeMap<String, String>, expected: &Version) -> ConfigMap {
    let (label_key, label_value) = GLOBALNET_COMPONENT_LABEL;
    stored
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(label_key.to_string(), label_value.to_string());
    stored.metadata.resource_version = Some(expected.as_str().to_string());
    stored.data.get_or_insert_with(BTreeMap::new).extend(data);
    stored
}

#[async_trait]
impl VersionedLedger for ConfigMapLedger {
    fn name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn read(&self) -> Result<(GlobalAllocationRecord, Version)> {
        let cm = self
            .api
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", self.name()))?;

        let version = cm.metadata.resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("ledger", format!("{} has no resourceVersion", self.name()))
        })?;
        let record = GlobalAllocationRecord::from_data(&cm.data.unwrap_or_default())?;
        Ok((record, Version::new(version)))
    }

    async fn write_if_unchanged(
        &self,
        record: &GlobalAllocationRecord,
        expected: &Version,
    ) -> Result<()> {
        let stored = self
            .api
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", self.name()))?;
        let cm = overlay_ledger(stored, record.to_data()?, expected);

        match self.api.replace(&self.name, &PostParams::default(), &cm).await {
            Ok(_) => {
                debug!(ledger = %self.name(), version = %expected, "Ledger updated");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(ledger = %self.name(), version = %expected, "Ledger changed since read");
                Err(Error::conflict(self.name()))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::not_found("ConfigMap", self.name())),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &GlobalAllocationRecord) -> Result<bool> {
        let cm = self.config_map(record.to_data()?);

        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                info!(ledger = %self.name(), supernet = %record.supernet, "Created global allocation ledger");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(ledger = %self.name(), "Ledger already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
