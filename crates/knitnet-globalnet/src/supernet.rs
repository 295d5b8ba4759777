//! Supernet and block arithmetic
//!
//! Blocks are power-of-two sized and aligned to their own size, so the
//! supernet divides into `capacity / block_size` disjoint slots.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

use knitnet_common::{Error, Result};

/// Largest block representable in IPv4
const MAX_BLOCK_SIZE: u64 = 1 << 32;

/// Parse a CIDR that must be a network address (no host bits set)
pub fn parse_network(field: &str, cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|e| Error::malformed(field, format!("{cidr:?} is not an IPv4 CIDR: {e}")))?;
    if net != net.trunc() {
        return Err(Error::malformed(
            field,
            format!("{cidr} has host bits set, did you mean {}?", net.trunc()),
        ));
    }
    Ok(net)
}

/// Number of addresses in a network
pub fn address_count(net: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// Round a block size up to the next power of two.
///
/// Zero and sizes above the IPv4 address space are rejected.
pub fn normalize_block_size(block_size: u64) -> Result<u64> {
    if block_size == 0 {
        return Err(Error::malformed(
            "globalnetClusterSize",
            "block size must be greater than zero",
        ));
    }
    if block_size > MAX_BLOCK_SIZE {
        return Err(Error::malformed(
            "globalnetClusterSize",
            format!("block size {block_size} exceeds the IPv4 address space"),
        ));
    }
    let normalized = block_size.next_power_of_two();
    if normalized != block_size {
        debug!(
            requested = block_size,
            normalized, "Block size rounded up to a power of two"
        );
    }
    Ok(normalized)
}

/// Prefix length of a block holding `block_size` addresses (a power of two)
pub fn block_prefix_len(block_size: u64) -> u8 {
    // block_size <= 2^32, so trailing_zeros <= 32
    (32 - block_size.trailing_zeros()) as u8
}

/// How many non-overlapping blocks of `block_size` addresses fit in `supernet`.
///
/// Fails if the supernet is malformed or cannot hold a single block.
pub fn validate_supernet(supernet: &str, block_size: u64) -> Result<u64> {
    let net = parse_network("globalnetCIDRRange", supernet)?;
    capacity_in_blocks(&net, block_size)
}

/// [`validate_supernet`] for an already parsed supernet
pub fn capacity_in_blocks(supernet: &Ipv4Net, block_size: u64) -> Result<u64> {
    let block_size = normalize_block_size(block_size)?;
    let capacity = address_count(supernet);
    if block_size > capacity {
        return Err(Error::malformed(
            "globalnetClusterSize",
            format!("block size {block_size} exceeds the {capacity} addresses of supernet {supernet}"),
        ));
    }
    let blocks = capacity / block_size;
    if blocks == 0 {
        return Err(Error::malformed(
            "globalnetCIDRRange",
            format!("supernet {supernet} holds no blocks of {block_size} addresses"),
        ));
    }
    Ok(blocks)
}

/// True if the two networks share any address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Block of `block_size` addresses starting at the absolute address `start`
pub(crate) fn block_at(start: u64, block_size: u64) -> Result<Ipv4Net> {
    let addr = u32::try_from(start)
        .map_err(|_| Error::internal_with_context("allocator", "block offset beyond IPv4"))?;
    Ipv4Net::new(Ipv4Addr::from(addr), block_prefix_len(block_size))
        .map_err(|e| Error::internal_with_context("allocator", e.to_string()))
}
