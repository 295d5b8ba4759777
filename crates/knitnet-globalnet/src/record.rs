//! The shared allocation record and its key/value wire format
//!
//! On the broker the record is a flat string map:
//!
//! | key                    | value                                         |
//! |------------------------|-----------------------------------------------|
//! | `globalnetEnabled`     | `"true"` / `"false"`                          |
//! | `globalnetCidrRange`   | JSON-quoted CIDR, e.g. `"\"242.0.0.0/8\""`    |
//! | `globalnetClusterSize` | decimal block size                            |
//! | `clusterinfo`          | JSON array of `{cluster_id, global_cidr: []}` |

use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use knitnet_common::{Error, Result, DEFAULT_GLOBALNET_CIDR_RANGE, DEFAULT_GLOBALNET_CLUSTER_SIZE};

use crate::supernet::overlaps;

/// Name of the ledger object on the broker
pub const GLOBALNET_CONFIG_MAP: &str = "submariner-globalnet-info";
/// Label key/value identifying the ledger object
pub const GLOBALNET_COMPONENT_LABEL: (&str, &str) = ("component", "submariner-globalnet");

/// Key: whether global addressing is enabled
pub const GLOBALNET_ENABLED_KEY: &str = "globalnetEnabled";
/// Key: the supernet, JSON-quoted
pub const GLOBALNET_CIDR_RANGE_KEY: &str = "globalnetCidrRange";
/// Key: default block size
pub const GLOBALNET_CLUSTER_SIZE_KEY: &str = "globalnetClusterSize";
/// Key: assignments
pub const CLUSTER_INFO_KEY: &str = "clusterinfo";

/// One cluster's entry in the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Cluster identity, unique within the record
    pub cluster_id: String,
    /// CNI plugin reported when the entry was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_plugin: Option<String>,
    /// Assigned blocks; normally exactly one
    #[serde(default)]
    pub global_cidr: Vec<Ipv4Net>,
}

impl ClusterAssignment {
    /// The block allocation decisions are based on
    pub fn primary(&self) -> Option<&Ipv4Net> {
        self.global_cidr.first()
    }
}

/// The ledger of address-space assignments for one broker domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalAllocationRecord {
    /// Whether global addressing is active
    pub globalnet_enabled: bool,
    /// Address space shared by all clusters
    pub supernet: Ipv4Net,
    /// Default addresses per cluster block
    pub default_block_size: u64,
    /// Assignments in first-allocation order
    pub assignments: Vec<ClusterAssignment>,
}

impl GlobalAllocationRecord {
    /// An empty record
    pub fn new(supernet: Ipv4Net, default_block_size: u64, globalnet_enabled: bool) -> Self {
        Self {
            globalnet_enabled,
            supernet,
            default_block_size,
            assignments: Vec::new(),
        }
    }

    /// Entry for a cluster, if it has one
    pub fn assignment(&self, cluster_id: &str) -> Option<&ClusterAssignment> {
        self.assignments.iter().find(|a| a.cluster_id == cluster_id)
    }

    /// Every block held by clusters other than `cluster_id`, with its owner
    pub fn blocks_excluding<'a>(
        &'a self,
        cluster_id: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Ipv4Net)> + 'a {
        self.assignments
            .iter()
            .filter(move |a| a.cluster_id != cluster_id)
            .flat_map(|a| a.global_cidr.iter().map(move |b| (a.cluster_id.as_str(), b)))
    }

    /// Record `cidr` as the cluster's block, replacing any previous entry.
    ///
    /// Entries are updated in place, never removed.
    pub fn assign(&mut self, cluster_id: &str, cidr: Ipv4Net, network_plugin: Option<String>) {
        match self
            .assignments
            .iter_mut()
            .find(|a| a.cluster_id == cluster_id)
        {
            Some(entry) => {
                entry.global_cidr = vec![cidr];
                if network_plugin.is_some() {
                    entry.network_plugin = network_plugin;
                }
            }
            None => self.assignments.push(ClusterAssignment {
                cluster_id: cluster_id.to_string(),
                network_plugin,
                global_cidr: vec![cidr],
            }),
        }
    }

    /// Check that cluster IDs are unique and every block is inside the
    /// supernet and disjoint from every other cluster's blocks.
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.assignments.iter().enumerate() {
            if self.assignments[..i]
                .iter()
                .any(|prior| prior.cluster_id == entry.cluster_id)
            {
                return Err(Error::malformed(
                    CLUSTER_INFO_KEY,
                    format!("cluster {} appears more than once", entry.cluster_id),
                ));
            }

            for block in &entry.global_cidr {
                if !self.supernet.contains(block) {
                    return Err(Error::OutOfBounds {
                        requested: block.to_string(),
                        supernet: self.supernet.to_string(),
                    });
                }
                for prior in &self.assignments[..i] {
                    if let Some(hit) = prior.global_cidr.iter().find(|b| overlaps(b, block)) {
                        return Err(Error::Overlap {
                            requested: block.to_string(),
                            existing: hit.to_string(),
                            cluster: prior.cluster_id.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Encode into the ledger's key/value form
    pub fn to_data(&self) -> Result<BTreeMap<String, String>> {
        let supernet = serde_json::to_string(&self.supernet.to_string())?;
        let cluster_info = serde_json::to_string_pretty(&self.assignments)?;

        Ok(BTreeMap::from([
            (
                GLOBALNET_ENABLED_KEY.to_string(),
                self.globalnet_enabled.to_string(),
            ),
            (GLOBALNET_CIDR_RANGE_KEY.to_string(), supernet),
            (
                GLOBALNET_CLUSTER_SIZE_KEY.to_string(),
                self.default_block_size.to_string(),
            ),
            (CLUSTER_INFO_KEY.to_string(), cluster_info),
        ]))
    }

    /// Decode from the ledger's key/value form
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let field = move |key: &str| {
            data.get(key)
                .map(String::as_str)
                .ok_or_else(|| Error::serialization_for_kind(GLOBALNET_CONFIG_MAP, format!("missing key {key}")))
        };
        let invalid = |key: &str, detail: String| {
            Error::serialization_for_kind(GLOBALNET_CONFIG_MAP, format!("invalid {key}: {detail}"))
        };

        let globalnet_enabled = match field(GLOBALNET_ENABLED_KEY)?.trim() {
            "true" => true,
            "false" => false,
            other => return Err(invalid(GLOBALNET_ENABLED_KEY, format!("{other:?}"))),
        };

        // A disabled ledger may carry only the flag and an empty cluster list
        let setting = |key: &str, default: &str| -> Result<String> {
            match (data.get(key), globalnet_enabled) {
                (Some(value), _) => Ok(value.clone()),
                (None, false) => Ok(default.to_string()),
                (None, true) => field(key).map(str::to_string),
            }
        };

        let raw_range = setting(GLOBALNET_CIDR_RANGE_KEY, DEFAULT_GLOBALNET_CIDR_RANGE)?;
        // Written JSON-quoted, but tolerate a bare CIDR
        let range = serde_json::from_str::<String>(&raw_range).unwrap_or_else(|_| raw_range.clone());
        let supernet: Ipv4Net = range
            .trim()
            .parse()
            .map_err(|e| invalid(GLOBALNET_CIDR_RANGE_KEY, format!("{range:?}: {e}")))?;

        let raw_size = setting(
            GLOBALNET_CLUSTER_SIZE_KEY,
            &DEFAULT_GLOBALNET_CLUSTER_SIZE.to_string(),
        )?;
        let default_block_size = raw_size
            .trim()
            .parse::<u64>()
            .map_err(|e| invalid(GLOBALNET_CLUSTER_SIZE_KEY, format!("{raw_size:?}: {e}")))?;

        let assignments = match data.get(CLUSTER_INFO_KEY).map(|s| s.trim()) {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| invalid(CLUSTER_INFO_KEY, e.to_string()))?,
        };

        Ok(Self {
            globalnet_enabled,
            supernet,
            default_block_size,
            assignments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().expect("valid CIDR")
    }

    fn record_with(entries: &[(&str, &str)]) -> GlobalAllocationRecord {
        let mut record = GlobalAllocationRecord::new(net("242.0.0.0/8"), 65536, true);
        for (id, cidr) in entries {
            record.assign(id, net(cidr), None);
        }
        record
    }

    #[test]
    fn encodes_broker_wire_format() {
        let mut record = record_with(&[("east", "242.0.0.0/16")]);
        record.assignments[0].network_plugin = Some("flannel".to_string());
        let data = record.to_data().unwrap();

        assert_eq!(data[GLOBALNET_ENABLED_KEY], "true");
        assert_eq!(data[GLOBALNET_CIDR_RANGE_KEY], "\"242.0.0.0/8\"");
        assert_eq!(data[GLOBALNET_CLUSTER_SIZE_KEY], "65536");

        let info: serde_json::Value = serde_json::from_str(&data[CLUSTER_INFO_KEY]).unwrap();
        assert_eq!(
            info,
            serde_json::json!([{
                "cluster_id": "east",
                "network_plugin": "flannel",
                "global_cidr": ["242.0.0.0/16"]
            }])
        );
    }

    #[test]
    fn decodes_record_written_by_other_brokers() {
        let data = BTreeMap::from([
            (GLOBALNET_ENABLED_KEY.to_string(), "true".to_string()),
            (GLOBALNET_CIDR_RANGE_KEY.to_string(), "\"169.254.0.0/16\"".to_string()),
            (GLOBALNET_CLUSTER_SIZE_KEY.to_string(), "8192".to_string()),
            (
                CLUSTER_INFO_KEY.to_string(),
                "[\n\t{\n\t\t\"cluster_id\": \"west\",\n\t\t\"global_cidr\": [\"169.254.0.0/19\"]\n\t}\n]"
                    .to_string(),
            ),
        ]);
        let record = GlobalAllocationRecord::from_data(&data).unwrap();
        assert!(record.globalnet_enabled);
        assert_eq!(record.supernet, net("169.254.0.0/16"));
        assert_eq!(record.default_block_size, 8192);
        assert_eq!(
            record.assignment("west").and_then(|a| a.primary()),
            Some(&net("169.254.0.0/19"))
        );
        assert_eq!(record.assignment("west").unwrap().network_plugin, None);
    }

    #[test]
    fn initial_record_has_empty_cluster_info() {
        let data = BTreeMap::from([
            (GLOBALNET_ENABLED_KEY.to_string(), "false".to_string()),
            (GLOBALNET_CIDR_RANGE_KEY.to_string(), "242.0.0.0/8".to_string()),
            (GLOBALNET_CLUSTER_SIZE_KEY.to_string(), "65536".to_string()),
            (CLUSTER_INFO_KEY.to_string(), "[]".to_string()),
        ]);
        let record = GlobalAllocationRecord::from_data(&data).unwrap();
        assert!(!record.globalnet_enabled);
        assert!(record.assignments.is_empty());
    }

    #[test]
    fn disabled_ledger_needs_only_flag_and_cluster_info() {
        let data = BTreeMap::from([
            (GLOBALNET_ENABLED_KEY.to_string(), "false".to_string()),
            (CLUSTER_INFO_KEY.to_string(), "[]".to_string()),
        ]);
        let record = GlobalAllocationRecord::from_data(&data).unwrap();
        assert!(!record.globalnet_enabled);
        assert_eq!(record.supernet, net(DEFAULT_GLOBALNET_CIDR_RANGE));
        assert_eq!(record.default_block_size, DEFAULT_GLOBALNET_CLUSTER_SIZE);
        assert!(record.assignments.is_empty());
    }

    #[test]
    fn enabled_ledger_requires_range_and_size() {
        let data = BTreeMap::from([
            (GLOBALNET_ENABLED_KEY.to_string(), "true".to_string()),
            (CLUSTER_INFO_KEY.to_string(), "[]".to_string()),
        ]);
        let err = GlobalAllocationRecord::from_data(&data).unwrap_err();
        assert!(err.to_string().contains("missing key globalnetCidrRange"));
    }

    #[test]
    fn decoding_reports_the_bad_key() {
        let mut data = record_with(&[]).to_data().unwrap();
        data.insert(GLOBALNET_CLUSTER_SIZE_KEY.to_string(), "lots".to_string());
        let err = GlobalAllocationRecord::from_data(&data).unwrap_err();
        assert!(err.to_string().contains(GLOBALNET_CLUSTER_SIZE_KEY));

        let mut data = record_with(&[]).to_data().unwrap();
        data.remove(GLOBALNET_ENABLED_KEY);
        let err = GlobalAllocationRecord::from_data(&data).unwrap_err();
        assert!(err.to_string().contains("missing key globalnetEnabled"));
    }

    #[test]
    fn assign_updates_in_place_and_keeps_order() {
        let mut record = record_with(&[("east", "242.0.0.0/16"), ("west", "242.1.0.0/16")]);
        record.assign("east", net("242.2.0.0/16"), Some("calico".to_string()));
        let ids: Vec<_> = record.assignments.iter().map(|a| a.cluster_id.as_str()).collect();
        assert_eq!(ids, ["east", "west"]);
        assert_eq!(record.assignments[0].global_cidr, vec![net("242.2.0.0/16")]);
        assert_eq!(record.assignments[0].network_plugin.as_deref(), Some("calico"));
    }

    #[test]
    fn validate_accepts_disjoint_blocks() {
        assert!(record_with(&[("east", "242.0.0.0/16"), ("west", "242.1.0.0/16")])
            .validate()
            .is_ok());
    }

    #[test]
    fn validate_rejects_overlap_and_escape() {
        let overlapping = record_with(&[("east", "242.0.0.0/16"), ("west", "242.0.128.0/17")]);
        assert!(matches!(
            overlapping.validate(),
            Err(Error::Overlap { ref cluster, .. }) if cluster == "east"
        ));

        let escaped = record_with(&[("east", "10.0.0.0/16")]);
        assert!(matches!(escaped.validate(), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn blocks_excluding_skips_own_entry() {
        let record = record_with(&[("east", "242.0.0.0/16"), ("west", "242.1.0.0/16")]);
        let others: Vec<_> = record.blocks_excluding("east").collect();
        assert_eq!(others, vec![("west", &net("242.1.0.0/16"))]);
    }
}
