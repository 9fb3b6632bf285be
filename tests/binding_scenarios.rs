use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use dhcpbind::config::{LinkConfig, Policies, PoolConfig, PrefixPoolConfig, StaticBindingConfig};
use dhcpbind::{
    BindingManager, BindingServer, Config, Duid, FileLeaseStore, IaType, IdentityKey, Lease,
    LeaseChanges, LeaseState, LeaseStore, Link, Request,
};

struct TestGuard(PathBuf);

impl Drop for TestGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn ip(address: &str) -> IpAddr {
    address.parse().unwrap()
}

fn link_config() -> LinkConfig {
    LinkConfig {
        name: "lan".to_string(),
        subnets: vec!["10.0.0.0/24".parse().unwrap(), "2001:db8::/32".parse().unwrap()],
        filters: Vec::new(),
        address_pools: Vec::new(),
        temporary_pools: Vec::new(),
        prefix_pools: Vec::new(),
        v4_pools: Vec::new(),
        static_bindings: Vec::new(),
    }
}

fn v4_config(start: &str, end: &str) -> Config {
    let mut link = link_config();
    link.v4_pools.push(PoolConfig {
        start: ip(start),
        end: ip(end),
        preferred_lifetime_seconds: None,
        valid_lifetime_seconds: None,
        filter: None,
        options: Vec::new(),
    });
    Config {
        leases_file: String::new(),
        policies: Policies::default(),
        links: vec![link],
    }
}

fn key(ia_type: IaType, id: u32) -> IdentityKey {
    let mut duid = vec![0, 2, 0, 0, 0x09, 0xbf];
    duid.extend_from_slice(&id.to_be_bytes());
    IdentityKey::new(Duid::new(duid), ia_type, id)
}

fn expired_lease(id: u32, address: &str, ended_seconds_ago: i64) -> Lease {
    let end = Utc::now() - TimeDelta::seconds(ended_seconds_ago);
    let key = key(IaType::V4, id);
    Lease {
        duid: key.duid,
        ia_type: IaType::V4,
        iaid: key.iaid,
        link: "lan".to_string(),
        address: ip(address),
        prefix_len: 32,
        state: LeaseState::Committed,
        start_time: Some(end - TimeDelta::seconds(3600)),
        preferred_end_time: Some(end),
        valid_end_time: Some(end),
    }
}

async fn v4_manager(
    config: &Config,
    store: Arc<FileLeaseStore>,
) -> (BindingManager<FileLeaseStore>, Link) {
    let manager = BindingManager::new(IaType::V4, config, store).await.unwrap();
    (manager, Link::from_config(&config.links[0]))
}

#[tokio::test]
async fn scenario_a_small_pool_exhausts() {
    let config = v4_config("10.0.0.1", "10.0.0.3");
    let (manager, link) = v4_manager(&config, Arc::new(FileLeaseStore::in_memory())).await;

    let mut seen = HashSet::new();
    for id in 1..=3 {
        let binding = manager
            .create_binding(
                &link,
                &key(IaType::V4, id),
                &[],
                &Request::new(),
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(seen.insert(binding.addresses()[0]));
    }
    assert_eq!(seen.len(), 3);

    let fourth = manager
        .create_binding(&link, &key(IaType::V4, 4), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap();
    assert!(fourth.is_none());
}

#[tokio::test]
async fn scenario_b_reaped_address_is_reused() {
    let config = v4_config("10.0.0.1", "10.0.0.1");
    let store = Arc::new(FileLeaseStore::in_memory());
    store
        .create_leases(vec![expired_lease(1, "10.0.0.1", 60)])
        .await
        .unwrap();
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    assert_eq!(manager.reap().await.unwrap(), 1);
    let reaped = store.find_lease_by_address(ip("10.0.0.1")).await.unwrap().unwrap();
    assert_eq!(reaped.state, LeaseState::Expired);

    let binding = manager
        .create_binding(&link, &key(IaType::V4, 2), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.addresses(), vec![ip("10.0.0.1")]);

    let stored = store.find_lease_by_address(ip("10.0.0.1")).await.unwrap().unwrap();
    assert_eq!(stored.identity(), key(IaType::V4, 2));
}

#[tokio::test]
async fn scenario_c_update_keeps_address() {
    let config = v4_config("10.0.0.1", "10.0.0.9");
    let (manager, link) = v4_manager(&config, Arc::new(FileLeaseStore::in_memory())).await;
    let client = key(IaType::V4, 1);

    let created = manager
        .create_binding(&link, &client, &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    let before = created.objects[0].valid_end_time;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let current = manager
        .find_current_binding(&link, &client, &Request::new())
        .await
        .unwrap()
        .unwrap();
    let renewed = manager
        .update_binding(current, &link, &client, &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(renewed.addresses(), created.addresses());
    assert!(renewed.objects[0].valid_end_time > before);
}

#[tokio::test]
async fn scenario_d_prefix_pool_exhausts_after_65536() {
    let mut link = link_config();
    link.prefix_pools.push(PrefixPoolConfig {
        prefix: "2001:db8::/32".parse().unwrap(),
        allocation_length: 48,
        preferred_lifetime_seconds: None,
        valid_lifetime_seconds: None,
        filter: None,
        options: Vec::new(),
    });
    let config = Config {
        leases_file: String::new(),
        policies: Policies::default(),
        links: vec![link],
    };
    let manager = BindingManager::new(IaType::Pd, &config, Arc::new(FileLeaseStore::in_memory()))
        .await
        .unwrap();
    let link = Link::from_config(&config.links[0]);

    assert_eq!(manager.stats()[0].stats.capacity, 1 << 16);
    for id in 0..(1u32 << 16) {
        let binding = manager
            .create_binding(
                &link,
                &key(IaType::Pd, id),
                &[],
                &Request::new(),
                LeaseState::Committed,
            )
            .await
            .unwrap();
        assert!(binding.is_some(), "prefix {} was not allocated", id);
    }

    let overflow = manager
        .create_binding(
            &link,
            &key(IaType::Pd, 1 << 16),
            &[],
            &Request::new(),
            LeaseState::Committed,
        )
        .await
        .unwrap();
    assert!(overflow.is_none());
    assert_eq!(manager.stats()[0].stats.used, 1 << 16);
}

#[tokio::test]
async fn static_binding_wins_over_hint_and_pool() {
    let mut config = v4_config("10.0.0.1", "10.0.0.9");
    config.links[0].address_pools.push(PoolConfig {
        start: ip("2001:db8::100"),
        end: ip("2001:db8::1ff"),
        preferred_lifetime_seconds: None,
        valid_lifetime_seconds: None,
        filter: None,
        options: Vec::new(),
    });
    let client = key(IaType::Na, 7);
    config.links[0].static_bindings.push(StaticBindingConfig {
        ia_type: IaType::Na,
        duid: Some(client.duid.clone()),
        iaid: None,
        mac_address: None,
        address: ip("2001:db8::150"),
        prefix_length: None,
        preferred_lifetime_seconds: Some(-1),
        valid_lifetime_seconds: Some(-1),
        hostname: Some("nas".to_string()),
        options: Vec::new(),
    });

    let server = BindingServer::new(config, Arc::new(FileLeaseStore::in_memory()))
        .await
        .unwrap();
    let link = server.link("lan").unwrap().clone();
    let manager = server.manager(IaType::Na);

    let binding = manager
        .create_binding(
            &link,
            &client,
            &[ip("2001:db8::101")],
            &Request::new(),
            LeaseState::Advertised,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.addresses(), vec![ip("2001:db8::150")]);
    assert_eq!(binding.objects[0].state, LeaseState::Static);
    assert_eq!(binding.objects[0].valid_end_time, Some(dhcpbind::binding::infinity()));

    // The reserved address is skipped by dynamic allocation.
    let pools = manager.pools(&link);
    assert!(pools[0].is_used(ip("2001:db8::150")));
    let other = manager
        .create_binding(
            &link,
            &key(IaType::Na, 8),
            &[ip("2001:db8::150")],
            &Request::new(),
            LeaseState::Advertised,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.addresses(), vec![ip("2001:db8::100")]);
}

#[tokio::test]
async fn exhausted_pool_reuses_oldest_unused_lease() {
    let config = v4_config("10.0.0.1", "10.0.0.2");
    let store = Arc::new(FileLeaseStore::in_memory());
    store
        .create_leases(vec![
            expired_lease(1, "10.0.0.1", 10),
            expired_lease(2, "10.0.0.2", 500),
        ])
        .await
        .unwrap();
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    let first = manager
        .create_binding(&link, &key(IaType::V4, 3), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.addresses(), vec![ip("10.0.0.2")]);
    assert!(store.find_leases(&key(IaType::V4, 2)).await.unwrap().is_empty());

    let second = manager
        .create_binding(&link, &key(IaType::V4, 4), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.addresses(), vec![ip("10.0.0.1")]);

    let third = manager
        .create_binding(&link, &key(IaType::V4, 5), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap();
    assert!(third.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_unique_addresses() {
    let config = v4_config("10.0.0.1", "10.0.0.40");
    let (manager, link) = v4_manager(&config, Arc::new(FileLeaseStore::in_memory())).await;
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for id in 0..48 {
        let manager = Arc::clone(&manager);
        let link = link.clone();
        handles.push(tokio::spawn(async move {
            manager
                .create_binding(
                    &link,
                    &key(IaType::V4, id),
                    &[],
                    &Request::new(),
                    LeaseState::Committed,
                )
                .await
                .unwrap()
                .map(|binding| binding.addresses()[0])
        }));
    }

    let mut addresses = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(address) => assert!(addresses.insert(address), "{} allocated twice", address),
            None => exhausted += 1,
        }
    }
    assert_eq!(addresses.len(), 40);
    assert_eq!(exhausted, 8);
}

#[tokio::test]
async fn leases_survive_reload() {
    let path = std::env::temp_dir().join("dhcpbind_test_reload.json");
    let _guard = TestGuard(path.clone());
    let _ = std::fs::remove_file(&path);
    let config = v4_config("10.0.0.1", "10.0.0.9");
    let client = key(IaType::V4, 1);

    {
        let store = Arc::new(FileLeaseStore::open(&path).await.unwrap());
        let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;
        manager
            .create_binding(
                &link,
                &client,
                &[ip("10.0.0.5")],
                &Request::new(),
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        store.flush().await.unwrap();
    }

    let store = Arc::new(FileLeaseStore::open(&path).await.unwrap());
    let (manager, link) = v4_manager(&config, store).await;

    let current = manager
        .find_current_binding(&link, &client, &Request::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.addresses(), vec![ip("10.0.0.5")]);
    assert_eq!(current.state, LeaseState::Committed);

    // Reconciled: the reloaded address is not handed to anyone else.
    let mut others = Vec::new();
    for id in 2..=10 {
        if let Some(binding) = manager
            .create_binding(
                &link,
                &key(IaType::V4, id),
                &[],
                &Request::new(),
                LeaseState::Committed,
            )
            .await
            .unwrap()
        {
            others.extend(binding.addresses());
        }
    }
    assert_eq!(others.len(), 8);
    assert!(!others.contains(&ip("10.0.0.5")));
}

fn offer_lease(id: u32, address: &str, started_seconds_ago: i64) -> Lease {
    let start = Utc::now() - TimeDelta::seconds(started_seconds_ago);
    Lease {
        state: LeaseState::Advertised,
        start_time: Some(start),
        preferred_end_time: Some(start + TimeDelta::seconds(3600)),
        valid_end_time: Some(start + TimeDelta::seconds(3600)),
        ..expired_lease(id, address, 0)
    }
}

/// Moves the valid end of each lease into the past.
async fn end_lifetimes(store: &FileLeaseStore, leases: Vec<Lease>) {
    let ended = Utc::now() - TimeDelta::seconds(5);
    let updated = leases
        .into_iter()
        .map(|lease| Lease {
            preferred_end_time: Some(ended),
            valid_end_time: Some(ended),
            ..lease
        })
        .collect();
    store
        .update_leases(LeaseChanges {
            updated,
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_release_keeps_reassigned_address() {
    let mut config = v4_config("10.0.0.1", "10.0.0.1");
    config.policies.delete_released = true;
    let store = Arc::new(FileLeaseStore::in_memory());
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    let stale = manager
        .create_binding(&link, &key(IaType::V4, 1), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    end_lifetimes(&store, stale.to_leases()).await;
    assert_eq!(manager.reap().await.unwrap(), 1);

    let current = manager
        .create_binding(&link, &key(IaType::V4, 2), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.addresses(), vec![ip("10.0.0.1")]);

    // The first client releases what it still believes it holds.
    manager.release_binding(stale).await.unwrap();

    let pools = manager.pools(&link);
    assert!(pools[0].is_used(ip("10.0.0.1")));
    assert_eq!(manager.stats()[0].stats.used, 1);
    let holder = store.find_lease_by_address(ip("10.0.0.1")).await.unwrap().unwrap();
    assert_eq!(holder.identity(), key(IaType::V4, 2));
    assert_eq!(holder.state, LeaseState::Committed);
}

#[tokio::test]
async fn expired_lease_deleted_by_policy() {
    let mut config = v4_config("10.0.0.1", "10.0.0.1");
    config.policies.delete_expired = true;
    let store = Arc::new(FileLeaseStore::in_memory());
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    let binding = manager
        .create_binding(&link, &key(IaType::V4, 1), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    end_lifetimes(&store, binding.to_leases()).await;

    assert_eq!(manager.reap().await.unwrap(), 1);
    assert!(store.find_lease_by_address(ip("10.0.0.1")).await.unwrap().is_none());
    assert!(!manager.pools(&link)[0].is_used(ip("10.0.0.1")));
    assert_eq!(manager.reap().await.unwrap(), 0);
}

#[tokio::test]
async fn declined_lease_deleted_by_policy() {
    let mut config = v4_config("10.0.0.1", "10.0.0.1");
    config.policies.delete_declined = true;
    let store = Arc::new(FileLeaseStore::in_memory());
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    let binding = manager
        .create_binding(&link, &key(IaType::V4, 1), &[], &Request::new(), LeaseState::Advertised)
        .await
        .unwrap()
        .unwrap();
    manager.decline_binding(binding).await.unwrap();

    assert!(store.find_leases(&key(IaType::V4, 1)).await.unwrap().is_empty());
    assert!(!manager.pools(&link)[0].is_used(ip("10.0.0.1")));

    let next = manager
        .create_binding(&link, &key(IaType::V4, 2), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.addresses(), vec![ip("10.0.0.1")]);
}

#[tokio::test]
async fn abandoned_offer_is_reused_after_expiration() {
    let config = v4_config("10.0.0.1", "10.0.0.2");
    let store = Arc::new(FileLeaseStore::in_memory());
    store
        .create_leases(vec![offer_lease(1, "10.0.0.1", 60), offer_lease(2, "10.0.0.2", 0)])
        .await
        .unwrap();
    let (manager, link) = v4_manager(&config, Arc::clone(&store)).await;

    let binding = manager
        .create_binding(&link, &key(IaType::V4, 3), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.addresses(), vec![ip("10.0.0.1")]);
    assert!(store.find_leases(&key(IaType::V4, 1)).await.unwrap().is_empty());

    // The other offer is younger than the offer expiration and stays put.
    let none = manager
        .create_binding(&link, &key(IaType::V4, 4), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap();
    assert!(none.is_none());
    let offered = store.find_lease_by_address(ip("10.0.0.2")).await.unwrap().unwrap();
    assert_eq!(offered.identity(), key(IaType::V4, 2));
}

#[tokio::test]
async fn static_binding_served_from_full_pool() {
    let mut config = v4_config("10.0.0.1", "10.0.0.2");
    let client = key(IaType::V4, 9);
    config.links[0].static_bindings.push(StaticBindingConfig {
        ia_type: IaType::V4,
        duid: Some(client.duid.clone()),
        iaid: None,
        mac_address: None,
        address: ip("10.0.0.2"),
        prefix_length: None,
        preferred_lifetime_seconds: None,
        valid_lifetime_seconds: None,
        hostname: None,
        options: Vec::new(),
    });
    let (manager, link) = v4_manager(&config, Arc::new(FileLeaseStore::in_memory())).await;

    let dynamic = manager
        .create_binding(&link, &key(IaType::V4, 1), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dynamic.addresses(), vec![ip("10.0.0.1")]);
    let full = manager
        .create_binding(&link, &key(IaType::V4, 2), &[], &Request::new(), LeaseState::Committed)
        .await
        .unwrap();
    assert!(full.is_none());
    assert_eq!(manager.stats()[0].stats.used, 2);

    let binding = manager
        .create_binding(&link, &client, &[ip("10.0.0.1")], &Request::new(), LeaseState::Committed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.addresses(), vec![ip("10.0.0.2")]);
    assert_eq!(binding.state, LeaseState::Static);
}
