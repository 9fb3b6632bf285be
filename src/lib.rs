//! # dhcpbind
//!
//! The lease binding and address allocation engine of a DHCPv4/DHCPv6
//! server. It decides which address or delegated prefix a client gets,
//! tracks each binding through its lifecycle, persists it, and reclaims
//! it when its lifetime ends. Decoding and sending DHCP messages is left
//! to the protocol layer that calls into it.
//!
//! ## Features
//!
//! - IA_NA, IA_TA, IA_PD and DHCPv4 bindings
//! - Sparse bitmap allocator covering a full 128-bit address space
//! - Client hints, link filters and static bindings
//! - Reuse of the oldest unused lease when a pool is exhausted
//! - Lease persistence across restarts, with pool reconciliation
//! - Background reaper for expired leases
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dhcpbind::{BindingServer, Config, FileLeaseStore, IaType, LeaseState, Request};
//!
//! #[tokio::main]
//! async fn main() -> dhcpbind::Result<()> {
//!     let config = Config::load_or_create("config.json").await?;
//!     let store = Arc::new(FileLeaseStore::open(&config.leases_file).await?);
//!     let mut server = BindingServer::new(config, store).await?;
//!     server.start_reaper();
//!
//!     let request = Request::new().with_link_address("192.168.1.1".parse().unwrap());
//!     let link = server.find_link(&request).cloned().unwrap();
//!     let key = dhcpbind::IdentityKey::new("01:aa:bb:cc:dd:ee:ff".parse()?, IaType::V4, 0);
//!     let binding = server
//!         .manager(IaType::V4)
//!         .create_binding(&link, &key, &[], &request, LeaseState::Advertised)
//!         .await?;
//!     println!("{:?}", binding.map(|binding| binding.addresses()));
//!
//!     server.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Links, pools, filters, static bindings and policies
//! - [`BindingServer`] - Owns the managers, the store and the reaper
//! - [`BindingManager`] - Allocation and lease lifecycle for one IA type
//! - [`BindingPool`] - One configured range and its allocator
//! - [`FreeList`] - Sparse bitmap over a `u128` unit domain
//! - [`LeaseStore`] - Persistence interface; [`FileLeaseStore`] implements it
//! - [`Reaper`] - Periodic expiration of ended leases

pub mod allocator;
pub mod binding;
pub mod config;
pub mod error;
pub mod filter;
pub mod link;
pub mod manager;
pub mod pool;
pub mod range;
pub mod reaper;
pub mod request;
pub mod server;
pub mod static_binding;
pub mod store;

pub use allocator::FreeList;
pub use binding::{
    Binding, BindingObject, BindingSource, Duid, IaType, IdentityKey, LeaseState, Leased,
    Lifetime, set_binding_object_times,
};
pub use config::Config;
pub use error::{Error, Result};
pub use filter::{FilterExpression, FilterOperator, LinkFilter};
pub use link::Link;
pub use manager::{BindingManager, PoolUsage};
pub use pool::{AddressBindingPool, BindingPool, PoolStats, PrefixBindingPool, V4BindingPool};
pub use range::AddressRange;
pub use reaper::Reaper;
pub use request::Request;
pub use server::BindingServer;
pub use static_binding::StaticBinding;
pub use store::{FileLeaseStore, Lease, LeaseChanges, LeaseStore};
