//! Per-subnet address pool
//!
//! A contiguous bitmap over the host offsets of one CIDR. The lowest free
//! offset is handed out first. IPv6 subnets are capped at
//! [`MAX_POOL_SIZE`] offsets from the network address.

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Largest number of offsets tracked for one subnet
pub(crate) const MAX_POOL_SIZE: u128 = 1 << 16;

pub(crate) fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub(crate) fn u128_to_addr(value: u128, v4: bool) -> IpAddr {
    if v4 {
        // Offsets of an IPv4 pool never leave the 32-bit space.
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

/// Outcome of marking one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mark {
    Allocated,
    AlreadyAllocated,
}

#[derive(Debug, Clone)]
pub(crate) struct AddressPool {
    subnet: IpNet,
    base: u128,
    size: u128,
    bits: Vec<u64>,
    reserved: BTreeSet<u128>,
    allocated: usize,
}

impl AddressPool {
    /// Pool over `subnet` with the network address (and IPv4 broadcast)
    /// excluded.
    pub(crate) fn new(subnet: IpNet) -> Self {
        let host_bits = u32::from(subnet.max_prefix_len() - subnet.prefix_len());
        let span = if host_bits >= 127 { u128::MAX } else { 1u128 << host_bits };
        let size = span.min(MAX_POOL_SIZE);
        let words = size.div_ceil(64) as usize;

        let mut reserved = BTreeSet::new();
        reserved.insert(0);
        if subnet.addr().is_ipv4() && size == span {
            reserved.insert(size - 1);
        }

        Self {
            subnet,
            base: addr_to_u128(subnet.network()),
            size,
            bits: vec![0; words],
            reserved,
            allocated: 0,
        }
    }

    pub(crate) fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub(crate) fn is_ipv4(&self) -> bool {
        self.subnet.addr().is_ipv4()
    }

    /// Exclude an address from allocation (gateway, management port, ...).
    pub(crate) fn reserve(&mut self, addr: IpAddr) {
        if let Some(offset) = self.offset(addr) {
            self.reserved.insert(offset);
        }
    }

    /// Offset of `addr` within the pool, if it is allocatable at all.
    pub(crate) fn offset(&self, addr: IpAddr) -> Option<u128> {
        if addr.is_ipv4() != self.is_ipv4() || !self.subnet.contains(&addr) {
            return None;
        }
        let offset = addr_to_u128(addr) - self.base;
        (offset < self.size).then_some(offset)
    }

    pub(crate) fn is_reserved(&self, offset: u128) -> bool {
        self.reserved.contains(&offset)
    }

    pub(crate) fn contains_allocatable(&self, addr: IpAddr) -> bool {
        self.offset(addr).is_some_and(|offset| !self.is_reserved(offset))
    }

    fn word_and_mask(offset: u128) -> (usize, u64) {
        ((offset / 64) as usize, 1u64 << (offset % 64))
    }

    pub(crate) fn is_set(&self, offset: u128) -> bool {
        let (word, mask) = Self::word_and_mask(offset);
        self.bits[word] & mask != 0
    }

    /// Caller must have checked the offset with [`Self::contains_allocatable`].
    pub(crate) fn mark(&mut self, offset: u128) -> Mark {
        let (word, mask) = Self::word_and_mask(offset);
        if self.bits[word] & mask != 0 {
            return Mark::AlreadyAllocated;
        }
        self.bits[word] |= mask;
        self.allocated += 1;
        Mark::Allocated
    }

    /// Returns true when the address was allocated and is now free.
    pub(crate) fn release(&mut self, addr: IpAddr) -> bool {
        let Some(offset) = self.offset(addr) else {
            return false;
        };
        if self.is_reserved(offset) {
            return false;
        }
        let (word, mask) = Self::word_and_mask(offset);
        if self.bits[word] & mask == 0 {
            return false;
        }
        self.bits[word] &= !mask;
        self.allocated -= 1;
        true
    }

    /// Allocate the lowest free address.
    pub(crate) fn allocate_next(&mut self) -> Option<IpAddr> {
        let mut offset = 0;
        while offset < self.size {
            let (word, _) = Self::word_and_mask(offset);
            if self.bits[word] == u64::MAX {
                offset = (word as u128 + 1) * 64;
                continue;
            }
            if !self.is_reserved(offset) && !self.is_set(offset) {
                self.mark(offset);
                return Some(u128_to_addr(self.base + offset, self.is_ipv4()));
            }
            offset += 1;
        }
        None
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn capacity(&self) -> usize {
        (self.size - self.reserved.len() as u128) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_pool_skips_network_and_broadcast() {
        let mut pool = AddressPool::new(net("10.1.2.0/30"));
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.allocate_next(), Some(ip("10.1.2.1")));
        assert_eq!(pool.allocate_next(), Some(ip("10.1.2.2")));
        assert_eq!(pool.allocate_next(), None);
    }

    #[test]
    fn test_reserved_addresses_are_not_handed_out() {
        let mut pool = AddressPool::new(net("10.1.2.0/24"));
        pool.reserve(ip("10.1.2.1"));
        pool.reserve(ip("10.1.2.2"));
        assert_eq!(pool.allocate_next(), Some(ip("10.1.2.3")));
        assert!(!pool.contains_allocatable(ip("10.1.2.1")));
    }

    #[test]
    fn test_release_frees_lowest_offset_again() {
        let mut pool = AddressPool::new(net("10.1.2.0/24"));
        let first = pool.allocate_next().unwrap();
        let second = pool.allocate_next().unwrap();
        assert!(pool.release(first));
        assert!(!pool.release(first), "second release is a no-op");
        assert_eq!(pool.allocate_next(), Some(first));
        assert_ne!(first, second);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn test_ipv6_pool_is_capped() {
        let pool = AddressPool::new(net("fd00:10:244:1::/64"));
        assert_eq!(pool.capacity() as u128, MAX_POOL_SIZE - 1);
        assert!(pool.offset(ip("fd00:10:244:1::1:0")).is_none());
        assert!(pool.offset(ip("fd00:10:244:1::ffff")).is_some());
    }

    #[test]
    fn test_other_family_is_out_of_range() {
        let pool = AddressPool::new(net("10.1.2.0/24"));
        assert!(pool.offset(ip("fd00::1")).is_none());
        assert!(pool.offset(ip("10.1.3.1")).is_none());
    }
}
