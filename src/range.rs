//! Address ranges and the integer view of IP addresses used by the allocator.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Converts an address to its integer value.
///
/// IPv4 addresses occupy the low 32 bits.
pub fn ip_to_u128(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Converts an integer back to an address of the same family as `family`.
///
/// Returns `None` when the value does not fit an IPv4 address.
pub fn u128_to_ip(value: u128, family: IpAddr) -> Option<IpAddr> {
    match family {
        IpAddr::V4(_) => u32::try_from(value).ok().map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpAddr::V6(_) => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// An inclusive range of addresses of one family.
///
/// Immutable once built from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    /// Builds a range, rejecting inverted ranges and mixed families.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self> {
        if start.is_ipv4() != end.is_ipv4() {
            return Err(Error::InvalidConfig(format!(
                "range {} - {} mixes address families",
                start, end
            )));
        }
        if ip_to_u128(start) > ip_to_u128(end) {
            return Err(Error::InvalidConfig(format!(
                "range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn is_ipv4(&self) -> bool {
        self.start.is_ipv4()
    }

    /// Returns true if `address` is of the range's family and within it.
    pub fn contains(&self, address: IpAddr) -> bool {
        if address.is_ipv4() != self.is_ipv4() {
            return false;
        }
        let value = ip_to_u128(address);
        value >= ip_to_u128(self.start) && value <= ip_to_u128(self.end)
    }

    /// Returns true if the two ranges share at least one address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && ip_to_u128(self.start) <= ip_to_u128(other.end)
            && ip_to_u128(other.start) <= ip_to_u128(self.end)
    }

    /// Number of addresses in the range minus one.
    ///
    /// The full IPv6 space holds 2^128 addresses, which does not fit a `u128`.
    pub fn span(&self) -> u128 {
        ip_to_u128(self.end) - ip_to_u128(self.start)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}
