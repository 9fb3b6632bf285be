use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::binding::{Duid, IaType, Lifetime};
use crate::error::{Error, Result};
use crate::filter::{FilterOperator, LinkFilter};
use crate::range::AddressRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub leases_file: String,
    #[serde(default)]
    pub policies: Policies,
    pub links: Vec<LinkConfig>,
}

/// Engine-wide policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    /// Default DHCPv6 preferred lifetime; negative means infinite.
    pub preferred_lifetime_seconds: i64,
    /// Default DHCPv6 valid lifetime; negative means infinite.
    pub valid_lifetime_seconds: i64,
    /// Default DHCPv4 lease time; negative means infinite.
    pub v4_lease_seconds: i64,
    /// How long an advertised (offered) object reserves its address.
    pub offer_expiration_seconds: u64,
    pub reaper_startup_delay_seconds: u64,
    pub reaper_interval_seconds: u64,
    /// Delete released leases instead of keeping them in `released` state.
    pub delete_released: bool,
    /// Delete declined leases instead of keeping them in `declined` state.
    pub delete_declined: bool,
    /// Delete expired leases instead of keeping them in `expired` state.
    pub delete_expired: bool,
    /// Mark addresses of stored leases used when the pools are built.
    pub reconcile_on_startup: bool,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            preferred_lifetime_seconds: 3600,
            valid_lifetime_seconds: 3600,
            v4_lease_seconds: 3600,
            offer_expiration_seconds: 12,
            reaper_startup_delay_seconds: 10,
            reaper_interval_seconds: 60,
            delete_released: false,
            delete_declined: false,
            delete_expired: false,
            reconcile_on_startup: true,
        }
    }
}

impl Policies {
    /// Preferred and valid lifetimes for an IA type, with optional overrides.
    ///
    /// DHCPv4 has a single lease time, used for both.
    pub fn lifetimes(
        &self,
        ia_type: IaType,
        preferred_override: Option<i64>,
        valid_override: Option<i64>,
    ) -> (Lifetime, Lifetime) {
        match ia_type {
            IaType::V4 => {
                let lease = valid_override.unwrap_or(self.v4_lease_seconds);
                (Lifetime::seconds(lease), Lifetime::seconds(lease))
            }
            _ => (
                Lifetime::seconds(preferred_override.unwrap_or(self.preferred_lifetime_seconds)),
                Lifetime::seconds(valid_override.unwrap_or(self.valid_lifetime_seconds)),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    /// Subnets used to resolve a request's link address to this link.
    pub subnets: Vec<IpNet>,
    #[serde(default)]
    pub filters: Vec<LinkFilter>,
    #[serde(default)]
    pub address_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub temporary_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub prefix_pools: Vec<PrefixPoolConfig>,
    #[serde(default)]
    pub v4_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub static_bindings: Vec<StaticBindingConfig>,
}

impl LinkConfig {
    /// The address pools serving an IA type; prefix pools are separate.
    pub fn address_pools_for(&self, ia_type: IaType) -> &[PoolConfig] {
        match ia_type {
            IaType::Na => &self.address_pools,
            IaType::Ta => &self.temporary_pools,
            IaType::V4 => &self.v4_pools,
            IaType::Pd => &[],
        }
    }

    pub fn filter(&self, name: &str) -> Option<&LinkFilter> {
        self.filters.iter().find(|filter| filter.name == name)
    }
}

/// A pool-scoped option handed to the protocol layer with each lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOption {
    pub code: u16,
    pub value: String,
}

/// An address pool: a contiguous start..=end range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub start: IpAddr,
    pub end: IpAddr,
    #[serde(default)]
    pub preferred_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub valid_lifetime_seconds: Option<i64>,
    /// Name of a link filter the request must match to use this pool.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub options: Vec<ConfigOption>,
}

/// A prefix delegation pool: `prefix` carved into `/allocation_length` blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixPoolConfig {
    pub prefix: Ipv6Net,
    pub allocation_length: u8,
    #[serde(default)]
    pub preferred_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub valid_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub options: Vec<ConfigOption>,
}

/// A fixed assignment for one client.
///
/// Matches by `duid` (and `iaid`, when given) or by `mac_address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticBindingConfig {
    pub ia_type: IaType,
    #[serde(default)]
    pub duid: Option<Duid>,
    #[serde(default)]
    pub iaid: Option<u32>,
    #[serde(default)]
    pub mac_address: Option<String>,
    pub address: IpAddr,
    /// Delegated prefix length, required for `pd` bindings.
    #[serde(default)]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub preferred_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub valid_lifetime_seconds: Option<i64>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub options: Vec<ConfigOption>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leases_file: "leases.json".to_string(),
            policies: Policies::default(),
            links: vec![LinkConfig {
                name: "lan".to_string(),
                subnets: vec![
                    IpNet::V4(Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap_or_default()),
                    IpNet::V6(
                        Ipv6Net::new(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0), 64)
                            .unwrap_or_default(),
                    ),
                ],
                filters: Vec::new(),
                address_pools: vec![PoolConfig {
                    start: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0x100)),
                    end: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0xffff, 0xffff)),
                    preferred_lifetime_seconds: None,
                    valid_lifetime_seconds: None,
                    filter: None,
                    options: Vec::new(),
                }],
                temporary_pools: Vec::new(),
                prefix_pools: vec![PrefixPoolConfig {
                    prefix: Ipv6Net::new(Ipv6Addr::new(0x2001, 0xdb8, 0x100, 0, 0, 0, 0, 0), 40)
                        .unwrap_or_default(),
                    allocation_length: 56,
                    preferred_lifetime_seconds: None,
                    valid_lifetime_seconds: None,
                    filter: None,
                    options: Vec::new(),
                }],
                v4_pools: vec![PoolConfig {
                    start: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
                    end: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 200)),
                    preferred_lifetime_seconds: None,
                    valid_lifetime_seconds: None,
                    filter: None,
                    options: Vec::new(),
                }],
                static_bindings: Vec::new(),
            }],
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|link| link.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_policies()?;

        let mut names = HashSet::new();
        let mut v6_ranges: Vec<(String, AddressRange)> = Vec::new();
        let mut v4_ranges: Vec<(String, AddressRange)> = Vec::new();
        let mut prefixes: Vec<(String, Ipv6Net)> = Vec::new();

        for link in &self.links {
            if !names.insert(link.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "link name '{}' is used more than once",
                    link.name
                )));
            }
            validate_filters(link)?;

            for (ia_type, pools) in [
                (IaType::Na, &link.address_pools),
                (IaType::Ta, &link.temporary_pools),
                (IaType::V4, &link.v4_pools),
            ] {
                for pool in pools {
                    let range = AddressRange::new(pool.start, pool.end)?;
                    if range.is_ipv4() != (ia_type == IaType::V4) {
                        return Err(Error::InvalidConfig(format!(
                            "{} pool {} on link '{}' has the wrong address family",
                            ia_type, range, link.name
                        )));
                    }
                    validate_pool_extras(
                        link,
                        pool.filter.as_deref(),
                        pool.preferred_lifetime_seconds,
                        pool.valid_lifetime_seconds,
                    )?;
                    let ranges = if range.is_ipv4() {
                        &mut v4_ranges
                    } else {
                        &mut v6_ranges
                    };
                    if let Some((other_link, other)) =
                        ranges.iter().find(|(_, other)| other.overlaps(&range))
                    {
                        return Err(Error::InvalidConfig(format!(
                            "pool {} on link '{}' overlaps pool {} on link '{}'",
                            range, link.name, other, other_link
                        )));
                    }
                    ranges.push((link.name.clone(), range));
                }
            }

            for pool in &link.prefix_pools {
                if pool.allocation_length < pool.prefix.prefix_len() || pool.allocation_length > 128
                {
                    return Err(Error::InvalidConfig(format!(
                        "prefix pool {} on link '{}' has invalid allocation length /{}",
                        pool.prefix, link.name, pool.allocation_length
                    )));
                }
                validate_pool_extras(
                    link,
                    pool.filter.as_deref(),
                    pool.preferred_lifetime_seconds,
                    pool.valid_lifetime_seconds,
                )?;
                if let Some((other_link, other)) = prefixes
                    .iter()
                    .find(|(_, other)| other.contains(&pool.prefix) || pool.prefix.contains(other))
                {
                    return Err(Error::InvalidConfig(format!(
                        "prefix pool {} on link '{}' overlaps prefix pool {} on link '{}'",
                        pool.prefix, link.name, other, other_link
                    )));
                }
                prefixes.push((link.name.clone(), pool.prefix.trunc()));
            }

            for binding in &link.static_bindings {
                validate_static_binding(link, binding)?;
            }
        }

        // Leases are keyed by address, so a delegated prefix must not share
        // its base address with an IA_NA or IA_TA address.
        for (link, prefix) in &prefixes {
            let span =
                AddressRange::new(IpAddr::V6(prefix.network()), IpAddr::V6(prefix.broadcast()))?;
            if let Some((other_link, range)) =
                v6_ranges.iter().find(|(_, range)| range.overlaps(&span))
            {
                return Err(Error::InvalidConfig(format!(
                    "prefix pool {} on link '{}' overlaps address pool {} on link '{}'",
                    prefix, link, range, other_link
                )));
            }
        }

        Ok(())
    }

    fn validate_policies(&self) -> Result<()> {
        let policies = &self.policies;
        if policies.preferred_lifetime_seconds == 0
            || policies.valid_lifetime_seconds == 0
            || policies.v4_lease_seconds == 0
        {
            return Err(Error::InvalidConfig(
                "default lifetimes must not be 0".to_string(),
            ));
        }
        if policies.reaper_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "reaper_interval_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_filters(link: &LinkConfig) -> Result<()> {
    let mut names = HashSet::new();
    for filter in &link.filters {
        if !names.insert(filter.name.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "filter '{}' on link '{}' is defined more than once",
                filter.name, link.name
            )));
        }
        if filter.expressions.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "filter '{}' on link '{}' has no expressions",
                filter.name, link.name
            )));
        }
        for expression in &filter.expressions {
            if expression.operator != FilterOperator::Exists && expression.value.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "filter '{}' on link '{}': expression on '{}' needs a value",
                    filter.name, link.name, expression.attribute
                )));
            }
        }
    }
    Ok(())
}

fn validate_pool_extras(
    link: &LinkConfig,
    filter: Option<&str>,
    preferred: Option<i64>,
    valid: Option<i64>,
) -> Result<()> {
    if let Some(name) = filter
        && link.filter(name).is_none()
    {
        return Err(Error::InvalidConfig(format!(
            "link '{}' has no filter named '{}'",
            link.name, name
        )));
    }
    if preferred == Some(0) || valid == Some(0) {
        return Err(Error::InvalidConfig(format!(
            "pool lifetimes on link '{}' must not be 0",
            link.name
        )));
    }
    Ok(())
}

fn validate_static_binding(link: &LinkConfig, binding: &StaticBindingConfig) -> Result<()> {
    if binding.duid.is_none() && binding.mac_address.is_none() {
        return Err(Error::InvalidConfig(format!(
            "static binding {} on link '{}' needs a duid or mac_address",
            binding.address, link.name
        )));
    }
    if let Some(mac) = &binding.mac_address {
        parse_mac(mac)?;
    }
    if binding.address.is_ipv4() != (binding.ia_type == IaType::V4) {
        return Err(Error::InvalidConfig(format!(
            "static {} binding {} on link '{}' has the wrong address family",
            binding.ia_type, binding.address, link.name
        )));
    }
    match (binding.ia_type, binding.prefix_length) {
        (IaType::Pd, None) => Err(Error::InvalidConfig(format!(
            "static prefix binding {} on link '{}' needs a prefix_length",
            binding.address, link.name
        ))),
        (IaType::Pd, Some(len)) if len > 128 => Err(Error::InvalidConfig(format!(
            "static prefix binding {} on link '{}' has invalid prefix length /{}",
            binding.address, link.name, len
        ))),
        (IaType::Pd, Some(_)) => Ok(()),
        (_, Some(_)) => Err(Error::InvalidConfig(format!(
            "static address binding {} on link '{}' must not set prefix_length",
            binding.address, link.name
        ))),
        (_, None) => Ok(()),
    }
}

/// Parses a MAC address written with `:` or `-` separators.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let normalized = mac.to_lowercase().replace('-', ":");
    let bytes = normalized
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", mac)))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", mac)))
}
