//! Subnet address allocator.
//!
//! Owns one set of address pools per logical switch (node). Each switch has
//! one pool per assigned subnet; addresses are allocated per IP family so a
//! dual-stack switch hands out one IPv4 and one IPv6 address per pod.
//!
//! Pools for different switches are locked independently; calls for the same
//! switch are serialized.

mod pool;

use pool::{AddressPool, Mark, addr_to_u128, u128_to_addr};

use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of_net(net: &IpNet) -> Self {
        Self::of_addr(&net.addr())
    }

    pub fn of_addr(addr: &IpAddr) -> Self {
        if addr.is_ipv4() { IpFamily::V4 } else { IpFamily::V6 }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Allocator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// Malformed or overlapping subnet configuration
    #[error("invalid subnets for switch {switch}: {reason}")]
    Config { switch: String, reason: String },

    /// Address is outside the switch's subnets or reserved
    #[error("address {address} is not allocatable on switch {switch}")]
    OutOfRange { switch: String, address: IpAddr },

    /// No pool has been initialized for the switch
    #[error("logical switch {0} has no allocation pool")]
    SwitchUnknown(String),

    /// Every address of a family is in use
    #[error("no free {family} addresses on switch {switch}")]
    PoolExhausted { switch: String, family: IpFamily },
}

/// Successful outcome of [`SubnetAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// Every address was free and is now reserved
    Allocated,
    /// At least one address was already reserved; callers treat this as success
    AlreadyAllocated,
}

/// Usage of one subnet pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUsage {
    pub subnet: IpNet,
    pub family: IpFamily,
    pub allocated: usize,
    pub capacity: usize,
}

/// Address `n` hosts into `subnet`, carrying the subnet's prefix length.
pub fn nth_host(subnet: &IpNet, n: u128) -> IpNet {
    let addr = u128_to_addr(addr_to_u128(subnet.network()) + n, subnet.addr().is_ipv4());
    // The prefix length comes from a valid IpNet of the same family.
    IpNet::new(addr, subnet.prefix_len()).unwrap_or(*subnet)
}

/// Gateway (router port) address of a node subnet: the first host.
pub fn gateway_addr(subnet: &IpNet) -> IpNet {
    nth_host(subnet, 1)
}

/// Management port address of a node subnet: the second host.
pub fn management_addr(subnet: &IpNet) -> IpNet {
    nth_host(subnet, 2)
}

/// Hybrid overlay next-hop address of a node subnet: the third host.
pub fn hybrid_overlay_addr(subnet: &IpNet) -> IpNet {
    nth_host(subnet, 3)
}

#[derive(Debug, Default)]
struct SwitchPools {
    pools: Vec<AddressPool>,
}

impl SwitchPools {
    fn pool_for(&mut self, addr: IpAddr) -> Option<&mut AddressPool> {
        self.pools.iter_mut().find(|p| p.contains_allocatable(addr))
    }

    fn subnets(&self) -> Vec<IpNet> {
        self.pools.iter().map(AddressPool::subnet).collect()
    }

    fn families(&self) -> Vec<IpFamily> {
        let mut families: Vec<IpFamily> = self
            .pools
            .iter()
            .map(|p| IpFamily::of_net(&p.subnet()))
            .collect();
        families.sort();
        families.dedup();
        families
    }
}

/// Per-switch address allocator.
///
/// Constructed once by the controller's composition root and shared by
/// reference; there is no process-global instance.
#[derive(Debug, Default)]
pub struct SubnetAllocator {
    switches: RwLock<HashMap<String, Arc<Mutex<SwitchPools>>>>,
    reserve_hybrid_overlay: bool,
}

impl SubnetAllocator {
    /// Creates an allocator. With `reserve_hybrid_overlay` the third host of
    /// every subnet is kept for the hybrid overlay next-hop.
    pub fn new(reserve_hybrid_overlay: bool) -> Self {
        Self {
            switches: RwLock::new(HashMap::new()),
            reserve_hybrid_overlay,
        }
    }

    fn switch(&self, name: &str) -> Option<Arc<Mutex<SwitchPools>>> {
        self.switches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// (Re)creates the pools of a switch from its subnet list.
    ///
    /// Existing allocations for the switch are discarded; callers re-assert
    /// live addresses afterwards.
    pub fn initialize_switch(&self, name: &str, subnets: &[IpNet]) -> Result<(), AllocatorError> {
        let config_error = |reason: String| AllocatorError::Config {
            switch: name.to_string(),
            reason,
        };

        if subnets.is_empty() {
            return Err(config_error("no subnets given".to_string()));
        }

        let subnets: Vec<IpNet> = subnets.iter().map(IpNet::trunc).collect();
        for (i, a) in subnets.iter().enumerate() {
            let min_host_bits = if a.addr().is_ipv4() { 2 } else { 1 };
            if a.max_prefix_len() - a.prefix_len() < min_host_bits {
                return Err(config_error(format!("subnet {} is too small", a)));
            }
            for b in &subnets[i + 1..] {
                if a.contains(b) || b.contains(a) {
                    return Err(config_error(format!("subnets {} and {} overlap", a, b)));
                }
            }
        }

        let pools = subnets
            .iter()
            .map(|subnet| {
                let mut pool = AddressPool::new(*subnet);
                pool.reserve(gateway_addr(subnet).addr());
                pool.reserve(management_addr(subnet).addr());
                if self.reserve_hybrid_overlay {
                    pool.reserve(hybrid_overlay_addr(subnet).addr());
                }
                pool
            })
            .collect();

        let previous = self
            .switches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(Mutex::new(SwitchPools { pools })));
        if previous.is_some() {
            info!("Reinitialized address pools for switch {}: {:?}", name, subnets);
        } else {
            info!("Initialized address pools for switch {}: {:?}", name, subnets);
        }
        Ok(())
    }

    /// Registers a switch that has no host subnets (node outside the overlay).
    pub fn add_no_host_subnet_switch(&self, name: &str) {
        self.switches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(Mutex::new(SwitchPools::default())));
        debug!("Registered switch {} without host subnets", name);
    }

    /// True when the switch is known but has no host subnets.
    pub fn is_non_host_subnet_switch(&self, name: &str) -> bool {
        self.switch(name).is_some_and(|switch| {
            switch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pools
                .is_empty()
        })
    }

    /// Forgets a switch and all of its allocations.
    pub fn delete_switch(&self, name: &str) {
        if self
            .switches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
        {
            info!("Removed address pools for switch {}", name);
        }
    }

    /// Subnets assigned to a switch; `None` when the switch has no pools.
    pub fn switch_subnets(&self, name: &str) -> Option<Vec<IpNet>> {
        let switch = self.switch(name)?;
        let pools = switch.lock().unwrap_or_else(PoisonError::into_inner);
        (!pools.pools.is_empty()).then(|| pools.subnets())
    }

    /// Marks specific addresses as in use.
    ///
    /// Every address is checked before any is marked, so a failed call leaves
    /// the pools untouched. Re-allocating an address that is already in use is
    /// reported as [`AllocationOutcome::AlreadyAllocated`].
    pub fn allocate(&self, name: &str, addresses: &[IpNet]) -> Result<AllocationOutcome, AllocatorError> {
        let switch = self
            .switch(name)
            .ok_or_else(|| AllocatorError::SwitchUnknown(name.to_string()))?;
        let mut pools = switch.lock().unwrap_or_else(PoisonError::into_inner);

        for address in addresses {
            if pools.pool_for(address.addr()).is_none() {
                return Err(AllocatorError::OutOfRange {
                    switch: name.to_string(),
                    address: address.addr(),
                });
            }
        }

        let mut outcome = AllocationOutcome::Allocated;
        for address in addresses {
            if let Some(pool) = pools.pool_for(address.addr()) {
                let offset = pool.offset(address.addr());
                if let Some(offset) = offset {
                    if pool.mark(offset) == Mark::AlreadyAllocated {
                        outcome = AllocationOutcome::AlreadyAllocated;
                    }
                }
            }
        }
        debug!("Allocated {:?} on switch {} ({:?})", addresses, name, outcome);
        Ok(outcome)
    }

    /// Allocates the next free address of every configured family.
    ///
    /// Either one address per family is returned or nothing is allocated.
    pub fn allocate_next(&self, name: &str) -> Result<Vec<IpNet>, AllocatorError> {
        let switch = self
            .switch(name)
            .ok_or_else(|| AllocatorError::SwitchUnknown(name.to_string()))?;
        let mut pools = switch.lock().unwrap_or_else(PoisonError::into_inner);
        if pools.pools.is_empty() {
            return Err(AllocatorError::SwitchUnknown(name.to_string()));
        }

        let mut allocated: Vec<IpNet> = Vec::new();
        for family in pools.families() {
            let next = pools
                .pools
                .iter_mut()
                .filter(|p| IpFamily::of_net(&p.subnet()) == family)
                .find_map(|p| {
                    p.allocate_next()
                        .and_then(|addr| IpNet::new(addr, p.subnet().prefix_len()).ok())
                });
            match next {
                Some(address) => allocated.push(address),
                None => {
                    for address in &allocated {
                        if let Some(pool) = pools.pool_for(address.addr()) {
                            pool.release(address.addr());
                        }
                    }
                    warn!("Switch {} has no free {} addresses", name, family);
                    return Err(AllocatorError::PoolExhausted {
                        switch: name.to_string(),
                        family,
                    });
                }
            }
        }
        debug!("Allocated next addresses {:?} on switch {}", allocated, name);
        Ok(allocated)
    }

    /// Returns addresses to the free pool.
    ///
    /// Unknown switches, foreign addresses and addresses that were never
    /// allocated are ignored. Returns how many addresses were actually freed.
    pub fn release(&self, name: &str, addresses: &[IpNet]) -> usize {
        let Some(switch) = self.switch(name) else {
            return 0;
        };
        let mut pools = switch.lock().unwrap_or_else(PoisonError::into_inner);
        let released = addresses
            .iter()
            .filter(|address| {
                pools
                    .pool_for(address.addr())
                    .is_some_and(|pool| pool.release(address.addr()))
            })
            .count();
        debug!("Released {} of {:?} on switch {}", released, addresses, name);
        released
    }

    /// True when the address is currently allocated on the switch.
    pub fn is_allocated(&self, name: &str, address: IpAddr) -> bool {
        let Some(switch) = self.switch(name) else {
            return false;
        };
        let mut pools = switch.lock().unwrap_or_else(PoisonError::into_inner);
        pools.pool_for(address).is_some_and(|pool| {
            pool.offset(address).is_some_and(|offset| pool.is_set(offset))
        })
    }

    /// Per-subnet usage of a switch.
    pub fn usage(&self, name: &str) -> Vec<PoolUsage> {
        let Some(switch) = self.switch(name) else {
            return Vec::new();
        };
        let pools = switch.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .pools
            .iter()
            .map(|pool| PoolUsage {
                subnet: pool.subnet(),
                family: IpFamily::of_net(&pool.subnet()),
                allocated: pool.allocated(),
                capacity: pool.capacity(),
            })
            .collect()
    }
}
