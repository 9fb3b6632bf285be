//! Binding pools: one configured range plus its allocator and policy.
//!
//! Three pool kinds share one [`BindingPool`] interface:
//!
//! - [`AddressBindingPool`] - IPv6 addresses for IA_NA and IA_TA
//! - [`PrefixBindingPool`] - delegated IPv6 prefixes for IA_PD
//! - [`V4BindingPool`] - IPv4 addresses
//!
//! Each pool converts between addresses and allocator units and keeps its
//! [`FreeList`] behind a mutex, so allocation and claiming are test-and-set
//! operations safe to call from concurrent requests. Logic common to the
//! three lives in free functions over the shared pool core.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::Ipv6Net;

use crate::allocator::FreeList;
use crate::binding::{Lifetime, Leased};
use crate::config::ConfigOption;
use crate::error::{Error, Result};
use crate::filter::LinkFilter;
use crate::range::{AddressRange, ip_to_u128, u128_to_ip};
use crate::request::Request;

/// Allocation counters for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub used: u128,
    pub capacity: u128,
}

/// A configured pool of addresses or prefixes.
pub trait BindingPool: fmt::Debug + Send + Sync {
    /// Name of the link the pool belongs to.
    fn link_name(&self) -> &str;

    /// First and last address covered by the pool.
    fn range(&self) -> AddressRange;

    fn contains(&self, address: IpAddr) -> bool;

    /// Aligns an address inside the pool to the unit that holds it.
    ///
    /// Addresses are their own unit; a prefix hint is truncated to the
    /// allocation length.
    fn canonical_address(&self, address: IpAddr) -> IpAddr {
        address
    }

    /// Allocates the next free unit, or `None` if the pool is exhausted.
    fn next_available_address(&self) -> Option<IpAddr>;

    fn set_used(&self, address: IpAddr);

    fn set_free(&self, address: IpAddr);

    fn is_used(&self, address: IpAddr) -> bool;

    /// Marks the unit used, returning false if it already was.
    fn try_claim(&self, address: IpAddr) -> bool;

    /// The lease value for an allocated address.
    fn leased(&self, address: IpAddr) -> Leased;

    fn preferred_lifetime(&self) -> Lifetime;

    fn valid_lifetime(&self) -> Lifetime;

    fn link_filter(&self) -> Option<&LinkFilter>;

    fn options(&self) -> &[ConfigOption];

    fn stats(&self) -> PoolStats;

    /// Returns true if the pool has no filter or its filter matches.
    fn accepts(&self, request: &Request) -> bool {
        self.link_filter()
            .is_none_or(|filter| filter.matches(request))
    }
}

/// State shared by every pool kind.
#[derive(Debug)]
struct PoolCore {
    link: String,
    range: AddressRange,
    allocator: Mutex<FreeList>,
    preferred: Lifetime,
    valid: Lifetime,
    filter: Option<Arc<LinkFilter>>,
    options: Vec<ConfigOption>,
}

impl PoolCore {
    fn new(
        link: &str,
        range: AddressRange,
        allocator: FreeList,
        lifetimes: (Lifetime, Lifetime),
        filter: Option<Arc<LinkFilter>>,
        options: Vec<ConfigOption>,
    ) -> Self {
        Self {
            link: link.to_string(),
            range,
            allocator: Mutex::new(allocator),
            preferred: lifetimes.0,
            valid: lifetimes.1,
            filter,
            options,
        }
    }

    fn allocator(&self) -> MutexGuard<'_, FreeList> {
        // A panic while holding the lock cannot leave the bitmap half
        // updated, so a poisoned lock is still usable.
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> PoolStats {
        let allocator = self.allocator();
        PoolStats {
            used: allocator.used_count(),
            capacity: allocator.capacity(),
        }
    }
}

fn next_unit(core: &PoolCore) -> Option<u128> {
    core.allocator().allocate_next()
}

fn set_unit(core: &PoolCore, unit: Option<u128>, used: bool) {
    if let Some(unit) = unit {
        let mut allocator = core.allocator();
        if used {
            allocator.mark_used(unit);
        } else {
            allocator.mark_free(unit);
        }
    }
}

fn claim_unit(core: &PoolCore, unit: Option<u128>) -> bool {
    unit.is_some_and(|unit| core.allocator().try_mark_used(unit))
}

fn unit_used(core: &PoolCore, unit: Option<u128>) -> bool {
    unit.is_some_and(|unit| core.allocator().is_used(unit))
}

/// An address pool: one unit per address.
#[derive(Debug)]
struct AddressPool {
    core: PoolCore,
}

impl AddressPool {
    fn build(
        link: &str,
        range: AddressRange,
        lifetimes: (Lifetime, Lifetime),
        filter: Option<Arc<LinkFilter>>,
        options: Vec<ConfigOption>,
    ) -> Result<Self> {
        let allocator = FreeList::new(ip_to_u128(range.start()), ip_to_u128(range.end()))?;
        Ok(Self {
            core: PoolCore::new(link, range, allocator, lifetimes, filter, options),
        })
    }

    fn unit(&self, address: IpAddr) -> Option<u128> {
        self.core
            .range
            .contains(address)
            .then(|| ip_to_u128(address))
    }

    fn address(&self, unit: u128) -> Option<IpAddr> {
        u128_to_ip(unit, self.core.range.start())
    }
}

macro_rules! address_pool_impl {
    ($name:ident) => {
        impl BindingPool for $name {
            fn link_name(&self) -> &str {
                &self.0.core.link
            }

            fn range(&self) -> AddressRange {
                self.0.core.range
            }

            fn contains(&self, address: IpAddr) -> bool {
                self.0.core.range.contains(address)
            }

            fn next_available_address(&self) -> Option<IpAddr> {
                next_unit(&self.0.core).and_then(|unit| self.0.address(unit))
            }

            fn set_used(&self, address: IpAddr) {
                set_unit(&self.0.core, self.0.unit(address), true);
            }

            fn set_free(&self, address: IpAddr) {
                set_unit(&self.0.core, self.0.unit(address), false);
            }

            fn is_used(&self, address: IpAddr) -> bool {
                unit_used(&self.0.core, self.0.unit(address))
            }

            fn try_claim(&self, address: IpAddr) -> bool {
                claim_unit(&self.0.core, self.0.unit(address))
            }

            fn leased(&self, address: IpAddr) -> Leased {
                Leased::Address(address)
            }

            fn preferred_lifetime(&self) -> Lifetime {
                self.0.core.preferred
            }

            fn valid_lifetime(&self) -> Lifetime {
                self.0.core.valid
            }

            fn link_filter(&self) -> Option<&LinkFilter> {
                self.0.core.filter.as_deref()
            }

            fn options(&self) -> &[ConfigOption] {
                &self.0.core.options
            }

            fn stats(&self) -> PoolStats {
                self.0.core.stats()
            }
        }
    };
}

/// IPv6 address pool for IA_NA and IA_TA bindings.
#[derive(Debug)]
pub struct AddressBindingPool(AddressPool);

impl AddressBindingPool {
    pub fn new(
        link: &str,
        range: AddressRange,
        lifetimes: (Lifetime, Lifetime),
        filter: Option<Arc<LinkFilter>>,
        options: Vec<ConfigOption>,
    ) -> Result<Self> {
        if range.is_ipv4() {
            return Err(Error::InvalidConfig(format!(
                "IPv6 address pool {} holds IPv4 addresses",
                range
            )));
        }
        AddressPool::build(link, range, lifetimes, filter, options).map(Self)
    }
}

address_pool_impl!(AddressBindingPool);

/// IPv4 address pool.
#[derive(Debug)]
pub struct V4BindingPool(AddressPool);

impl V4BindingPool {
    pub fn new(
        link: &str,
        range: AddressRange,
        lease_time: Lifetime,
        filter: Option<Arc<LinkFilter>>,
        options: Vec<ConfigOption>,
    ) -> Result<Self> {
        if !range.is_ipv4() {
            return Err(Error::InvalidConfig(format!(
                "IPv4 pool {} holds IPv6 addresses",
                range
            )));
        }
        AddressPool::build(link, range, (lease_time, lease_time), filter, options).map(Self)
    }
}

address_pool_impl!(V4BindingPool);

/// Delegated prefix pool: `subnet` carved into `/allocation_length` blocks.
///
/// Units are prefix numbers, `address >> (128 - allocation_length)`, so a
/// /32 pool delegating /48 blocks has 2^16 units.
#[derive(Debug)]
pub struct PrefixBindingPool {
    core: PoolCore,
    subnet: Ipv6Net,
    allocation_length: u8,
}

impl PrefixBindingPool {
    pub fn new(
        link: &str,
        subnet: Ipv6Net,
        allocation_length: u8,
        lifetimes: (Lifetime, Lifetime),
        filter: Option<Arc<LinkFilter>>,
        options: Vec<ConfigOption>,
    ) -> Result<Self> {
        if allocation_length < subnet.prefix_len() || allocation_length > 128 {
            return Err(Error::InvalidConfig(format!(
                "prefix pool {} cannot delegate /{} prefixes",
                subnet, allocation_length
            )));
        }
        let subnet = subnet.trunc();
        let range = AddressRange::new(
            IpAddr::V6(subnet.network()),
            IpAddr::V6(subnet.broadcast()),
        )?;
        let shift = u32::from(128 - allocation_length);
        let first = u128_shr(u128::from(subnet.network()), shift);
        let last = u128_shr(u128::from(subnet.broadcast()), shift);
        let allocator = FreeList::new(first, last)?;

        Ok(Self {
            core: PoolCore::new(link, range, allocator, lifetimes, filter, options),
            subnet,
            allocation_length,
        })
    }

    pub fn subnet(&self) -> Ipv6Net {
        self.subnet
    }

    pub fn allocation_length(&self) -> u8 {
        self.allocation_length
    }

    fn shift(&self) -> u32 {
        u32::from(128 - self.allocation_length)
    }

    fn unit(&self, address: IpAddr) -> Option<u128> {
        match address {
            IpAddr::V6(v6) if self.subnet.contains(&v6) => {
                Some(u128_shr(u128::from(v6), self.shift()))
            }
            _ => None,
        }
    }

    fn address(&self, unit: u128) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(u128_shl(unit, self.shift())))
    }
}

// Shifting a u128 by 128 overflows; a /0 allocation length needs it.
fn u128_shr(value: u128, shift: u32) -> u128 {
    value.checked_shr(shift).unwrap_or(0)
}

fn u128_shl(value: u128, shift: u32) -> u128 {
    value.checked_shl(shift).unwrap_or(0)
}

impl BindingPool for PrefixBindingPool {
    fn link_name(&self) -> &str {
        &self.core.link
    }

    fn range(&self) -> AddressRange {
        self.core.range
    }

    fn contains(&self, address: IpAddr) -> bool {
        self.unit(address).is_some()
    }

    fn canonical_address(&self, address: IpAddr) -> IpAddr {
        self.unit(address)
            .map(|unit| self.address(unit))
            .unwrap_or(address)
    }

    fn next_available_address(&self) -> Option<IpAddr> {
        next_unit(&self.core).map(|unit| self.address(unit))
    }

    fn set_used(&self, address: IpAddr) {
        set_unit(&self.core, self.unit(address), true);
    }

    fn set_free(&self, address: IpAddr) {
        set_unit(&self.core, self.unit(address), false);
    }

    fn is_used(&self, address: IpAddr) -> bool {
        unit_used(&self.core, self.unit(address))
    }

    fn try_claim(&self, address: IpAddr) -> bool {
        claim_unit(&self.core, self.unit(address))
    }

    fn leased(&self, address: IpAddr) -> Leased {
        let base = match self.canonical_address(address) {
            IpAddr::V6(v6) => v6,
            IpAddr::V4(_) => self.subnet.network(),
        };
        Leased::Prefix(Ipv6Net::new(base, self.allocation_length).unwrap_or(self.subnet))
    }

    fn preferred_lifetime(&self) -> Lifetime {
        self.core.preferred
    }

    fn valid_lifetime(&self) -> Lifetime {
        self.core.valid
    }

    fn link_filter(&self) -> Option<&LinkFilter> {
        self.core.filter.as_deref()
    }

    fn options(&self) -> &[ConfigOption] {
        &self.core.options
    }

    fn stats(&self) -> PoolStats {
        self.core.stats()
    }
}
