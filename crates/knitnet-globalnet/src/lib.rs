//! Global address allocation for clusters sharing one supernet
//!
//! Each joining cluster receives an exclusive, size-aligned block of the
//! supernet. Assignments live in a single shared ledger that is only ever
//! mutated through a compare-and-swap write, so concurrent joiners never
//! end up with overlapping blocks.

#![deny(missing_docs)]

pub mod allocator;
pub mod configmap;
pub mod ledger;
pub mod record;
pub mod supernet;

pub use allocator::{allocate, AllocationRequest, GlobalAllocator};
pub use configmap::ConfigMapLedger;
pub use ledger::{InMemoryLedger, Version, VersionedLedger};
pub use record::{ClusterAssignment, GlobalAllocationRecord, GLOBALNET_CONFIG_MAP};
pub use supernet::validate_supernet;
