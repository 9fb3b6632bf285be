//! Background expiration of leases whose valid lifetime has ended.
//!
//! The reaper waits a startup delay, then runs one pass per interval over
//! every binding manager. A pass that fails for one manager is logged and
//! the others still run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::manager::BindingManager;
use crate::store::LeaseStore;

/// Handle to the running reaper task.
#[derive(Debug)]
pub struct Reaper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Spawns the reaper task on the current tokio runtime.
    pub fn start<S: LeaseStore>(
        managers: Vec<Arc<BindingManager<S>>>,
        startup_delay: Duration,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                "Lease reaper starting in {}s, then every {}s",
                startup_delay.as_secs(),
                interval.as_secs()
            );

            tokio::select! {
                _ = tokio::time::sleep(startup_delay) => {}
                _ = shutdown_rx.changed() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_once(&managers).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Lease reaper stopped");
        });

        Self { shutdown, task }
    }

    /// Signals the task to stop and waits for it to finish its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            warn!("Lease reaper task failed: {}", error);
        }
    }
}

/// Runs one reaper pass over every manager, returning the number of
/// leases expired.
pub async fn run_once<S: LeaseStore>(managers: &[Arc<BindingManager<S>>]) -> usize {
    let mut total = 0;
    for manager in managers {
        match manager.reap().await {
            Ok(count) => total += count,
            Err(error) => warn!("{} reaper pass failed: {}", manager.ia_type(), error),
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Duid, IaType, LeaseState};
    use crate::config::{Config, LinkConfig, Policies, PoolConfig};
    use crate::store::{FileLeaseStore, Lease};
    use chrono::{TimeDelta, Utc};

    fn config() -> Config {
        Config {
            leases_file: String::new(),
            policies: Policies::default(),
            links: vec![LinkConfig {
                name: "lan".to_string(),
                subnets: vec!["10.0.0.0/24".parse().unwrap()],
                filters: Vec::new(),
                address_pools: Vec::new(),
                temporary_pools: Vec::new(),
                prefix_pools: Vec::new(),
                v4_pools: vec![PoolConfig {
                    start: "10.0.0.10".parse().unwrap(),
                    end: "10.0.0.20".parse().unwrap(),
                    preferred_lifetime_seconds: None,
                    valid_lifetime_seconds: None,
                    filter: None,
                    options: Vec::new(),
                }],
                static_bindings: Vec::new(),
            }],
        }
    }

    async fn store_with_expired_lease() -> Arc<FileLeaseStore> {
        let store = Arc::new(FileLeaseStore::in_memory());
        let past = Utc::now() - TimeDelta::seconds(30);
        store
            .create_leases(vec![Lease {
                duid: Duid::new(vec![1, 2, 3]),
                ia_type: IaType::V4,
                iaid: 0,
                link: "lan".to_string(),
                address: "10.0.0.12".parse().unwrap(),
                prefix_len: 32,
                state: LeaseState::Committed,
                start_time: Some(past - TimeDelta::seconds(60)),
                preferred_end_time: Some(past),
                valid_end_time: Some(past),
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_once_expires_leases() {
        let store = store_with_expired_lease().await;
        let manager = Arc::new(
            BindingManager::new(IaType::V4, &config(), Arc::clone(&store))
                .await
                .unwrap(),
        );

        assert_eq!(run_once(std::slice::from_ref(&manager)).await, 1);
        assert_eq!(run_once(std::slice::from_ref(&manager)).await, 0);

        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases[0].state, LeaseState::Expired);
    }

    #[tokio::test]
    async fn test_background_task_runs_and_stops() {
        let store = store_with_expired_lease().await;
        let manager = Arc::new(
            BindingManager::new(IaType::V4, &config(), Arc::clone(&store))
                .await
                .unwrap(),
        );

        let reaper = Reaper::start(vec![manager], Duration::ZERO, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        reaper.stop().await;

        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases[0].state, LeaseState::Expired);
    }
}
