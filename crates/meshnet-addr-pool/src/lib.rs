//! Virtual Address Pool (spec.md §4.7): deterministic allocation of virtual
//! addresses inside a party's private subnet, with /16-aligned expansion on
//! exhaustion.
//!
//! There's no direct teacher precedent for CIDR bookkeeping (firezone
//! leaves IP assignment to its clients' own static configuration), so this
//! is built from plain `u32`/`Ipv4Addr` arithmetic rather than reaching for
//! a dedicated crate — the math involved is small enough that pulling in a
//! CIDR library would just be another API to learn for no real gain.

use meshnet_model::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("virtual address pool exhausted")]
pub struct AddressPoolExhausted;

#[derive(Debug, Clone, Copy)]
pub struct AddressPoolConfig {
    /// The supernet subsequent /16 subnets are carved from, e.g.
    /// `10.66.0.0` with `supernet_prefix_len == 16`.
    pub supernet_base: Ipv4Addr,
    pub supernet_prefix_len: u8,
    /// Width of each working subnet within the supernet, e.g. `24`.
    pub subnet_prefix_len: u8,
    /// First host offset handed out within a subnet (default `2`, reserving
    /// `.0`/`.1` for the tunnel itself).
    pub start_offset: u32,
    /// Whether exhausting the current subnet expands to the next
    /// /16-aligned subnet, or fails immediately.
    pub allow_expansion: bool,
}

impl Default for AddressPoolConfig {
    fn default() -> Self {
        Self {
            supernet_base: Ipv4Addr::new(10, 66, 0, 0),
            supernet_prefix_len: 16,
            subnet_prefix_len: 24,
            start_offset: 2,
            allow_expansion: true,
        }
    }
}

struct Inner {
    config: AddressPoolConfig,
    /// Index of the subnet currently being filled, 0-based from the start
    /// of the supernet.
    current_subnet_index: u32,
    allocations: HashMap<PeerId, Ipv4Addr>,
    used: HashSet<Ipv4Addr>,
}

pub struct AddressPool {
    inner: Mutex<Inner>,
}

impl AddressPool {
    pub fn new(config: AddressPoolConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                current_subnet_index: 0,
                allocations: HashMap::new(),
                used: HashSet::new(),
            }),
        }
    }

    /// Allocates the first free host address in the subnet, scanning
    /// upward from `start_offset`, expanding to the next /16-aligned
    /// subnet on exhaustion if permitted (spec.md §4.7).
    pub fn allocate(&self, peer_id: PeerId) -> Result<Ipv4Addr, AddressPoolExhausted> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.allocations.get(&peer_id) {
            return Ok(*existing);
        }

        let hosts_per_subnet = 1u32 << (32 - inner.config.subnet_prefix_len as u32);
        let subnets_in_supernet = 1u32 << (inner.config.subnet_prefix_len as u32
            - inner.config.supernet_prefix_len as u32);

        loop {
            let subnet_base = u32::from(inner.config.supernet_base)
                + inner.current_subnet_index * hosts_per_subnet;

            for host_offset in inner.config.start_offset..hosts_per_subnet.saturating_sub(1) {
                let candidate = Ipv4Addr::from(subnet_base + host_offset);
                if !inner.used.contains(&candidate) {
                    inner.used.insert(candidate);
                    inner.allocations.insert(peer_id, candidate);
                    return Ok(candidate);
                }
            }

            if !inner.config.allow_expansion
                || inner.current_subnet_index + 1 >= subnets_in_supernet
            {
                return Err(AddressPoolExhausted);
            }

            inner.current_subnet_index += 1;
            tracing::debug!(
                subnet_index = inner.current_subnet_index,
                "virtual address subnet exhausted, expanding"
            );
        }
    }

    /// Returns `peer_id`'s address to the pool. Idempotent: releasing a
    /// peer with no allocation is a no-op (spec.md invariant: cleanup
    /// returns the address exactly once, but repeated cleanup calls must
    /// not panic).
    pub fn release(&self, peer_id: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(address) = inner.allocations.remove(&peer_id) {
            inner.used.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_start_offset_upward() {
        let pool = AddressPool::new(AddressPoolConfig::default());
        let first = pool.allocate(PeerId::random()).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 66, 0, 2));
    }

    #[test]
    fn same_peer_gets_same_address_on_repeat_allocate() {
        let pool = AddressPool::new(AddressPoolConfig::default());
        let peer = PeerId::random();
        let first = pool.allocate(peer).unwrap();
        let second = pool.allocate(peer).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn release_frees_the_address_for_reuse() {
        let pool = AddressPool::new(AddressPoolConfig::default());
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();

        let addr_a = pool.allocate(peer_a).unwrap();
        pool.release(peer_a);
        let addr_b = pool.allocate(peer_b).unwrap();

        assert_eq!(addr_a, addr_b);
    }

    #[test]
    fn release_of_unknown_peer_is_a_no_op() {
        let pool = AddressPool::new(AddressPoolConfig::default());
        pool.release(PeerId::random());
    }

    #[test]
    fn exhaustion_without_expansion_fails() {
        let config = AddressPoolConfig {
            subnet_prefix_len: 30, // 4 addresses total, offsets 2..3 usable
            allow_expansion: false,
            ..AddressPoolConfig::default()
        };
        let pool = AddressPool::new(config);

        assert!(pool.allocate(PeerId::random()).is_ok());
        assert_eq!(pool.allocate(PeerId::random()), Err(AddressPoolExhausted));
    }

    #[test]
    fn exhaustion_with_expansion_moves_to_next_subnet() {
        let config = AddressPoolConfig {
            subnet_prefix_len: 30,
            supernet_prefix_len: 28, // 4 subnets of size 4 inside one /28
            allow_expansion: true,
            ..AddressPoolConfig::default()
        };
        let pool = AddressPool::new(config);

        let first = pool.allocate(PeerId::random()).unwrap();
        let second = pool.allocate(PeerId::random()).unwrap();

        assert_eq!(first, Ipv4Addr::new(10, 66, 0, 2));
        assert_eq!(second, Ipv4Addr::new(10, 66, 0, 6));
    }
}
