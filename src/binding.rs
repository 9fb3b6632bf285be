//! In-memory bindings: one client identity association and its leases.
//!
//! A [`Binding`] is keyed by the identity tuple `(duid, IA type, IA id)` and
//! owns one [`BindingObject`] per leased address or prefix. Each object
//! remembers where it came from, either the dynamic pool that issued it or
//! the static binding that pins it, so that releasing it can hand the unit
//! back to the right allocator.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use crate::config::ConfigOption;
use crate::error::{Error, Result};
use crate::pool::BindingPool;
use crate::static_binding::StaticBinding;
use crate::store::Lease;

/// Timestamp used for "infinite" preferred/valid end times.
///
/// 9999-12-31T23:59:59Z round-trips through the millisecond lease encoding.
const INFINITE_EPOCH_SECONDS: i64 = 253_402_300_799;

/// Returns the timestamp that marks an infinite lifetime.
pub fn infinity() -> DateTime<Utc> {
    DateTime::from_timestamp(INFINITE_EPOCH_SECONDS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The kind of identity association a binding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IaType {
    /// DHCPv6 non-temporary addresses.
    Na,
    /// DHCPv6 temporary addresses.
    Ta,
    /// DHCPv6 delegated prefixes.
    Pd,
    /// DHCPv4 addresses.
    V4,
}

impl fmt::Display for IaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IaType::Na => "IA_NA",
            IaType::Ta => "IA_TA",
            IaType::Pd => "IA_PD",
            IaType::V4 => "V4",
        };
        f.write_str(name)
    }
}

/// A client identifier: the DUID for DHCPv6, the client-id or hardware
/// address for DHCPv4. Written as colon-separated hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Duid(Vec<u8>);

impl Duid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .0
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&hex)
    }
}

impl FromStr for Duid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let cleaned: String = s
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .collect();
        if cleaned.is_empty() || cleaned.len() % 2 != 0 {
            return Err(Error::InvalidConfig(format!("invalid client identifier '{}'", s)));
        }
        let bytes = (0..cleaned.len())
            .step_by(2)
            .map(|index| u8::from_str_radix(&cleaned[index..index + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidConfig(format!("invalid client identifier '{}'", s)))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Duid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Duid> for String {
    fn from(duid: Duid) -> Self {
        duid.to_string()
    }
}

/// The identity tuple a binding is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub duid: Duid,
    pub ia_type: IaType,
    pub iaid: u32,
}

impl IdentityKey {
    pub fn new(duid: Duid, ia_type: IaType, iaid: u32) -> Self {
        Self {
            duid,
            ia_type,
            iaid,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.duid, self.ia_type, self.iaid)
    }
}

/// Lifecycle state of a leased object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Advertised,
    Committed,
    Released,
    Declined,
    Expired,
    Static,
}

impl LeaseState {
    /// True for states in which no other client may be given the address.
    pub fn holds_address(self) -> bool {
        matches!(
            self,
            LeaseState::Advertised
                | LeaseState::Committed
                | LeaseState::Static
                | LeaseState::Declined
        )
    }

    /// True for states a binding is rehydrated from and the reaper watches.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LeaseState::Advertised | LeaseState::Committed | LeaseState::Static
        )
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseState::Advertised => "advertised",
            LeaseState::Committed => "committed",
            LeaseState::Released => "released",
            LeaseState::Declined => "declined",
            LeaseState::Expired => "expired",
            LeaseState::Static => "static",
        };
        f.write_str(name)
    }
}

/// A configured lifetime in seconds; negative means infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime(i64);

impl Lifetime {
    pub const INFINITE: Lifetime = Lifetime(-1);

    pub fn seconds(seconds: i64) -> Self {
        Self(seconds)
    }

    pub fn as_seconds(self) -> i64 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 < 0
    }

    /// The end time of this lifetime started at `now`.
    pub fn end_from(self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_infinite() {
            return infinity();
        }
        TimeDelta::try_seconds(self.0)
            .and_then(|delta| now.checked_add_signed(delta))
            .map(|end| end.min(infinity()))
            .unwrap_or_else(infinity)
    }
}

/// The leased value of a binding object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leased {
    Address(IpAddr),
    Prefix(Ipv6Net),
}

impl Leased {
    /// The address (or prefix base address) this value occupies.
    pub fn address(&self) -> IpAddr {
        match self {
            Leased::Address(address) => *address,
            Leased::Prefix(prefix) => IpAddr::V6(prefix.network()),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Leased::Address(IpAddr::V4(_)) => 32,
            Leased::Address(IpAddr::V6(_)) => 128,
            Leased::Prefix(prefix) => prefix.prefix_len(),
        }
    }
}

impl fmt::Display for Leased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leased::Address(address) => write!(f, "{}", address),
            Leased::Prefix(prefix) => write!(f, "{}", prefix),
        }
    }
}

/// Where a binding object's value came from.
#[derive(Debug, Clone)]
pub enum BindingSource {
    Pool(Arc<dyn BindingPool>),
    Static(Arc<StaticBinding>),
}

/// One leased address or prefix within a binding.
#[derive(Debug, Clone)]
pub struct BindingObject {
    pub leased: Leased,
    pub state: LeaseState,
    pub start_time: Option<DateTime<Utc>>,
    pub preferred_end_time: Option<DateTime<Utc>>,
    pub valid_end_time: Option<DateTime<Utc>>,
    pub source: BindingSource,
}

impl BindingObject {
    pub fn new(leased: Leased, state: LeaseState, source: BindingSource) -> Self {
        Self {
            leased,
            state,
            start_time: None,
            preferred_end_time: None,
            valid_end_time: None,
            source,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.leased.address()
    }

    pub fn is_static(&self) -> bool {
        matches!(self.source, BindingSource::Static(_))
    }

    /// The pool that issued this object, if it is dynamic.
    pub fn pool(&self) -> Option<&Arc<dyn BindingPool>> {
        match &self.source {
            BindingSource::Pool(pool) => Some(pool),
            BindingSource::Static(_) => None,
        }
    }

    /// Options configured on the issuing pool or static binding.
    pub fn options(&self) -> &[ConfigOption] {
        match &self.source {
            BindingSource::Pool(pool) => pool.options(),
            BindingSource::Static(binding) => &binding.options,
        }
    }

    /// Remaining valid lifetime in seconds, or 0 if expired or cleared.
    pub fn remaining_seconds(&self) -> i64 {
        self.valid_end_time
            .map(|end| (end - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }

    pub fn clear_times(&mut self) {
        self.start_time = None;
        self.preferred_end_time = None;
        self.valid_end_time = None;
    }

    /// The persisted form of this object.
    pub fn to_lease(&self, key: &IdentityKey, link: &str) -> Lease {
        Lease {
            duid: key.duid.clone(),
            ia_type: key.ia_type,
            iaid: key.iaid,
            link: link.to_string(),
            address: self.address(),
            prefix_len: self.leased.prefix_len(),
            state: self.state,
            start_time: self.start_time,
            preferred_end_time: self.preferred_end_time,
            valid_end_time: self.valid_end_time,
        }
    }
}

/// Stamps `object` as starting now with the given lifetimes.
pub fn set_binding_object_times(object: &mut BindingObject, preferred: Lifetime, valid: Lifetime) {
    let now = Utc::now();
    object.start_time = Some(now);
    object.preferred_end_time = Some(preferred.end_from(now));
    object.valid_end_time = Some(valid.end_from(now));
}

/// A client's identity association and the objects leased to it.
#[derive(Debug, Clone)]
pub struct Binding {
    pub key: IdentityKey,
    /// Name of the link the binding was made on.
    pub link: String,
    pub state: LeaseState,
    pub objects: Vec<BindingObject>,
}

impl Binding {
    pub fn new(key: IdentityKey, link: impl Into<String>, state: LeaseState) -> Self {
        Self {
            key,
            link: link.into(),
            state,
            objects: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.objects.iter().map(BindingObject::address).collect()
    }

    pub fn to_leases(&self) -> Vec<Lease> {
        self.objects
            .iter()
            .map(|object| object.to_lease(&self.key, &self.link))
            .collect()
    }
}
