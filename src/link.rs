//! Client links: the network segments pools and static bindings belong to.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::LinkConfig;

/// A configured link, identified by name and located by its subnets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    name: String,
    subnets: Vec<IpNet>,
}

impl Link {
    pub fn new(name: impl Into<String>, subnets: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            subnets,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.name.clone(), config.subnets.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnets(&self) -> &[IpNet] {
        &self.subnets
    }

    /// Returns true if `address` lies in one of the link's subnets.
    pub fn contains(&self, address: IpAddr) -> bool {
        self.subnets.iter().any(|subnet| subnet.contains(&address))
    }
}
