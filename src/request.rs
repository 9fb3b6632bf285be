//! The inbound request as seen by the binding engine.
//!
//! Decoding the wire message is the protocol layer's job. It hands the
//! engine only what allocation decisions depend on: where the request came
//! from, the client's hardware address, and the attributes link filters
//! match against (relay agent fields, vendor class, and so on).

use std::collections::HashMap;
use std::net::IpAddr;

/// Attributes of one inbound request that influence binding decisions.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Relay link-address (v6) or giaddr/interface address (v4) used to
    /// resolve the client's link.
    pub link_address: Option<IpAddr>,

    /// Client hardware address, used for MAC-keyed static bindings.
    pub mac_address: Option<[u8; 6]>,

    /// Named request attributes for link-filter matching.
    pub attributes: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link_address(mut self, address: IpAddr) -> Self {
        self.link_address = Some(address);
        self
    }

    pub fn with_mac_address(mut self, mac: [u8; 6]) -> Self {
        self.mac_address = Some(mac);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}
