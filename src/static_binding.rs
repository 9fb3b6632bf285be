//! Static bindings: configuration-declared fixed assignments.
//!
//! A static binding pins an address (or prefix) to a client regardless of
//! pool state. The manager looks these up before anything else and never
//! runs them through an allocator.

use std::net::IpAddr;

use ipnet::Ipv6Net;

use crate::binding::{Duid, IaType, IdentityKey, Leased, Lifetime};
use crate::config::{ConfigOption, Policies, StaticBindingConfig, parse_mac};
use crate::error::{Error, Result};
use crate::request::Request;

/// DUID-LLT type code (RFC 8415).
const DUID_LLT: u16 = 1;
/// DUID-LL type code (RFC 8415).
const DUID_LL: u16 = 3;
const HTYPE_ETHERNET: u16 = 1;

/// Extracts the Ethernet address embedded in a client identifier.
///
/// Understands DUID-LLT and DUID-LL with hardware type 1, and the DHCPv4
/// client-id form `01:<mac>`.
pub fn mac_from_duid(duid: &Duid) -> Option<[u8; 6]> {
    let bytes = duid.as_bytes();
    if bytes.len() == 7 && bytes[0] == 1 {
        return bytes[1..].try_into().ok();
    }
    if bytes.len() < 4 {
        return None;
    }
    let duid_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let hardware_type = u16::from_be_bytes([bytes[2], bytes[3]]);
    if hardware_type != HTYPE_ETHERNET {
        return None;
    }
    match duid_type {
        DUID_LLT if bytes.len() == 14 => bytes[8..].try_into().ok(),
        DUID_LL if bytes.len() == 10 => bytes[4..].try_into().ok(),
        _ => None,
    }
}

/// A fixed assignment, read-only at runtime.
#[derive(Debug, Clone)]
pub struct StaticBinding {
    pub link: String,
    pub ia_type: IaType,
    pub duid: Option<Duid>,
    pub iaid: Option<u32>,
    pub mac_address: Option<[u8; 6]>,
    pub leased: Leased,
    pub preferred_lifetime: Lifetime,
    pub valid_lifetime: Lifetime,
    pub hostname: Option<String>,
    pub options: Vec<ConfigOption>,
}

impl StaticBinding {
    pub fn from_config(
        link: &str,
        config: &StaticBindingConfig,
        policies: &Policies,
    ) -> Result<Self> {
        let mac_address = config.mac_address.as_deref().map(parse_mac).transpose()?;
        let leased = match (config.ia_type, config.address) {
            (IaType::Pd, IpAddr::V6(address)) => {
                let length = config.prefix_length.unwrap_or(128);
                let prefix = Ipv6Net::new(address, length).map_err(|_| {
                    Error::InvalidConfig(format!("invalid static prefix {}/{}", address, length))
                })?;
                Leased::Prefix(prefix.trunc())
            }
            (_, address) => Leased::Address(address),
        };
        let (preferred_lifetime, valid_lifetime) = policies.lifetimes(
            config.ia_type,
            config.preferred_lifetime_seconds,
            config.valid_lifetime_seconds,
        );

        Ok(Self {
            link: link.to_string(),
            ia_type: config.ia_type,
            duid: config.duid.clone(),
            iaid: config.iaid,
            mac_address,
            leased,
            preferred_lifetime,
            valid_lifetime,
            hostname: config.hostname.clone(),
            options: config.options.clone(),
        })
    }

    pub fn address(&self) -> IpAddr {
        self.leased.address()
    }

    /// Returns true if this binding applies to the identity and request.
    ///
    /// A configured DUID must match (and the IA id too, when configured);
    /// otherwise the configured MAC must match the request's hardware
    /// address or the one embedded in the client identifier.
    pub fn matches(&self, key: &IdentityKey, request: &Request) -> bool {
        if self.ia_type != key.ia_type {
            return false;
        }
        if let Some(duid) = &self.duid
            && *duid == key.duid
            && self.iaid.is_none_or(|iaid| iaid == key.iaid)
        {
            return true;
        }
        match self.mac_address {
            Some(mac) => {
                request.mac_address == Some(mac) || mac_from_duid(&key.duid) == Some(mac)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ia_type: IaType, address: &str) -> StaticBindingConfig {
        StaticBindingConfig {
            ia_type,
            duid: None,
            iaid: None,
            mac_address: None,
            address: address.parse().unwrap(),
            prefix_length: None,
            preferred_lifetime_seconds: None,
            valid_lifetime_seconds: None,
            hostname: None,
            options: Vec::new(),
        }
    }

    #[test]
    fn test_mac_from_duid() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

        let mut ll = vec![0, 3, 0, 1];
        ll.extend_from_slice(&mac);
        assert_eq!(mac_from_duid(&Duid::new(ll)), Some(mac));

        let mut llt = vec![0, 1, 0, 1, 0x12, 0x34, 0x56, 0x78];
        llt.extend_from_slice(&mac);
        assert_eq!(mac_from_duid(&Duid::new(llt)), Some(mac));

        let mut client_id = vec![1];
        client_id.extend_from_slice(&mac);
        assert_eq!(mac_from_duid(&Duid::new(client_id)), Some(mac));

        assert_eq!(mac_from_duid(&Duid::new(vec![0, 2, 0, 0, 1, 2, 3])), None);
    }

    #[test]
    fn test_match_by_duid_and_iaid() {
        let mut cfg = config(IaType::Na, "2001:db8::50");
        cfg.duid = Some("00:03:00:01:01:02:03:04:05:06".parse().unwrap());
        cfg.iaid = Some(9);
        let binding = StaticBinding::from_config("lan", &cfg, &Policies::default()).unwrap();
        let duid = cfg.duid.clone().unwrap();

        assert!(binding.matches(&IdentityKey::new(duid.clone(), IaType::Na, 9), &Request::new()));
        assert!(!binding.matches(&IdentityKey::new(duid.clone(), IaType::Na, 10), &Request::new()));
        assert!(!binding.matches(&IdentityKey::new(duid, IaType::Ta, 9), &Request::new()));
    }

    #[test]
    fn test_match_by_mac() {
        let mut cfg = config(IaType::V4, "192.168.1.50");
        cfg.mac_address = Some("aa:bb:cc:dd:ee:ff".to_string());
        let binding = StaticBinding::from_config("lan", &cfg, &Policies::default()).unwrap();
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

        let other = IdentityKey::new(Duid::new(vec![9, 9, 9]), IaType::V4, 0);
        assert!(binding.matches(&other, &Request::new().with_mac_address(mac)));
        assert!(!binding.matches(&other, &Request::new()));

        let mut client_id = vec![1];
        client_id.extend_from_slice(&mac);
        let by_client_id = IdentityKey::new(Duid::new(client_id), IaType::V4, 0);
        assert!(binding.matches(&by_client_id, &Request::new()));
    }

    #[test]
    fn test_static_prefix() {
        let mut cfg = config(IaType::Pd, "2001:db8:ff:1::");
        cfg.duid = Some("01:02".parse().unwrap());
        cfg.prefix_length = Some(56);
        let binding = StaticBinding::from_config("lan", &cfg, &Policies::default()).unwrap();
        assert_eq!(binding.leased.prefix_len(), 56);
        assert_eq!(binding.address(), "2001:db8:ff::".parse::<IpAddr>().unwrap());
    }
}
