//! Global CIDR allocation
//!
//! [`allocate`] is the pure decision: given a record and a request, which
//! block does the cluster get. [`GlobalAllocator::commit`] runs that decision
//! against the freshest ledger state and writes it back with a conditional
//! update, retrying the whole read-decide-write sequence on conflicts.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info, instrument, warn};

use knitnet_common::crd::validate_cluster_id;
use knitnet_common::retry::{retry_with_backoff_if, RetryConfig};
use knitnet_common::{Error, Result};

use crate::ledger::VersionedLedger;
use crate::record::GlobalAllocationRecord;
use crate::supernet::{
    address_count, block_at, capacity_in_blocks, normalize_block_size, overlaps, parse_network,
    validate_supernet,
};

/// What a cluster asks the allocator for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Requesting cluster
    pub cluster_id: String,
    /// Exact block to claim instead of drawing one
    pub explicit_cidr: Option<String>,
    /// Overrides the record's default block size
    pub block_size: Option<u64>,
    /// CNI plugin to note beside the assignment
    pub network_plugin: Option<String>,
}

impl AllocationRequest {
    /// Auto-allocation at the default block size
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    /// Claim a specific block
    pub fn with_explicit_cidr(mut self, cidr: Option<String>) -> Self {
        self.explicit_cidr = cidr.filter(|c| !c.trim().is_empty());
        self
    }

    /// Use a non-default block size
    pub fn with_block_size(mut self, block_size: Option<u64>) -> Self {
        self.block_size = block_size;
        self
    }

    /// Record the cluster's CNI plugin
    pub fn with_network_plugin(mut self, plugin: Option<String>) -> Self {
        self.network_plugin = plugin;
        self
    }

    /// Reject requests that can never be satisfied
    pub fn validate(&self) -> Result<()> {
        validate_cluster_id(&self.cluster_id)?;
        if self.explicit_cidr.is_some() && self.block_size.is_some() {
            return Err(Error::malformed(
                "globalnetClusterSize",
                "a block size cannot be combined with an explicit global CIDR",
            ));
        }
        Ok(())
    }
}

/// Decide which block `request.cluster_id` gets under `record`.
///
/// An explicit CIDR is checked and returned as-is. Otherwise a cluster that
/// already holds a block keeps it, and a new cluster gets the lowest free
/// block of the requested size.
pub fn allocate(record: &GlobalAllocationRecord, request: &AllocationRequest) -> Result<Ipv4Net> {
    match request.explicit_cidr.as_deref() {
        Some(cidr) => claim_explicit(record, &request.cluster_id, cidr),
        None => allocate_auto(record, request),
    }
}

fn claim_explicit(record: &GlobalAllocationRecord, cluster_id: &str, cidr: &str) -> Result<Ipv4Net> {
    let requested = parse_network("globalnetCIDR", cidr)?;

    if !record.supernet.contains(&requested) {
        return Err(Error::OutOfBounds {
            requested: requested.to_string(),
            supernet: record.supernet.to_string(),
        });
    }

    if let Some((owner, existing)) = record
        .blocks_excluding(cluster_id)
        .find(|(_, block)| overlaps(block, &requested))
    {
        return Err(Error::Overlap {
            requested: requested.to_string(),
            existing: existing.to_string(),
            cluster: owner.to_string(),
        });
    }

    Ok(requested)
}

fn allocate_auto(record: &GlobalAllocationRecord, request: &AllocationRequest) -> Result<Ipv4Net> {
    let block_size = normalize_block_size(request.block_size.unwrap_or(record.default_block_size))?;

    if let Some(existing) = record
        .assignment(&request.cluster_id)
        .and_then(|a| a.primary())
    {
        let held = address_count(existing);
        if held != block_size {
            // Resizing would renumber a live cluster; keep the block and flag it
            warn!(
                cluster_id = %request.cluster_id,
                block = %existing,
                held,
                requested = block_size,
                "Cluster already holds a block of a different size, keeping it"
            );
        }
        return Ok(*existing);
    }

    capacity_in_blocks(&record.supernet, block_size)?;

    let mut taken: Vec<(u64, u64)> = record
        .blocks_excluding(&request.cluster_id)
        .map(|(_, b)| (u64::from(u32::from(b.network())), address_count(b)))
        .collect();
    taken.sort_unstable();

    let base = u64::from(u32::from(record.supernet.network()));
    let end = base + address_count(&record.supernet);
    let mut offset = base;

    while offset + block_size <= end {
        let candidate_end = offset + block_size;
        match taken
            .iter()
            .find(|(start, len)| *start < candidate_end && offset < start + len)
        {
            Some((start, len)) => {
                // Skip past the collision, staying aligned to the block size
                let next = (start + len).max(candidate_end);
                offset = next.div_ceil(block_size) * block_size;
            }
            None => return block_at(offset, block_size),
        }
    }

    Err(Error::ExhaustedSpace {
        supernet: record.supernet.to_string(),
        block_size,
    })
}

/// Allocator bound to one shared ledger
#[derive(Clone)]
pub struct GlobalAllocator {
    ledger: Arc<dyn VersionedLedger>,
    retry: RetryConfig,
}

impl GlobalAllocator {
    /// Allocator with the default conflict budget
    pub fn new(ledger: Arc<dyn VersionedLedger>) -> Self {
        Self {
            ledger,
            retry: RetryConfig::on_conflict(),
        }
    }

    /// Override the conflict retry budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create the ledger for a broker domain, or adopt the one that exists.
    ///
    /// An existing ledger is validated but never overwritten.
    #[instrument(skip(self), fields(ledger = %self.ledger.name()))]
    pub async fn initialize(
        &self,
        supernet: &str,
        block_size: u64,
        globalnet_enabled: bool,
    ) -> Result<GlobalAllocationRecord> {
        if globalnet_enabled {
            let blocks = validate_supernet(supernet, block_size)?;
            debug!(blocks, "Supernet capacity");
        }
        let net = parse_network("globalnetCIDRRange", supernet)?;
        let block_size = normalize_block_size(block_size)?;
        let record = GlobalAllocationRecord::new(net, block_size, globalnet_enabled);

        if self.ledger.create(&record).await? {
            return Ok(record);
        }

        let (existing, _) = self.ledger.read().await?;
        existing.validate()?;
        if existing.supernet != record.supernet
            || existing.globalnet_enabled != record.globalnet_enabled
        {
            warn!(
                configured = %record.supernet,
                stored = %existing.supernet,
                stored_enabled = existing.globalnet_enabled,
                "Existing ledger differs from configuration, keeping the stored settings"
            );
        }
        Ok(existing)
    }

    /// Current ledger contents
    pub async fn get_record(&self) -> Result<GlobalAllocationRecord> {
        let (record, _) = self.ledger.read().await?;
        Ok(record)
    }

    /// Allocate a block for the request and persist it.
    ///
    /// Returns `None` if global addressing is disabled on the ledger. A
    /// cluster that already holds the decided block causes no write.
    #[instrument(skip(self, request), fields(cluster_id = %request.cluster_id))]
    pub async fn commit(&self, request: &AllocationRequest) -> Result<Option<Ipv4Net>> {
        request.validate()?;

        let ledger = self.ledger.as_ref();
        let result: Result<Option<Ipv4Net>> =
            retry_with_backoff_if(&self.retry, "ledger commit", Error::is_conflict, move || async move {
            let (mut record, version) = ledger.read().await?;

            if !record.globalnet_enabled {
                if request.explicit_cidr.is_some() {
                    warn!("Global addressing is disabled, ignoring explicit global CIDR");
                }
                return Ok(None);
            }

            let cidr = allocate(&record, request)?;
            let current = record
                .assignment(&request.cluster_id)
                .and_then(|a| a.primary());
            if current == Some(&cidr) {
                debug!(%cidr, "Cluster already holds this block");
                return Ok(Some(cidr));
            }

            record.assign(&request.cluster_id, cidr, request.network_plugin.clone());
            ledger.write_if_unchanged(&record, &version).await?;
            info!(%cidr, version = %version, "Global CIDR committed");
            Ok(Some(cidr))
        })
        .await;

        result.map_err(|e| {
            if e.is_conflict() {
                Error::ConflictRetriesExhausted {
                    resource: ledger.name(),
                    attempts: self.retry.max_attempts,
                }
            } else {
                e
            }
        })
    }
}
