use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::binding::IaType;
use crate::config::Config;
use crate::error::Result;
use crate::link::Link;
use crate::manager::{BindingManager, PoolUsage};
use crate::reaper::{self, Reaper};
use crate::request::Request;
use crate::store::LeaseStore;

/// The binding engine: configured links, one manager per IA type, the
/// lease store and the reaper.
pub struct BindingServer<S: LeaseStore> {
    config: Arc<Config>,
    links: Vec<Link>,
    store: Arc<S>,
    na: Arc<BindingManager<S>>,
    ta: Arc<BindingManager<S>>,
    pd: Arc<BindingManager<S>>,
    v4: Arc<BindingManager<S>>,
    reaper: Option<Reaper>,
}

impl<S: LeaseStore> BindingServer<S> {
    /// Validates the configuration, builds every pool and reconciles the
    /// pools with the leases already in `store`.
    pub async fn new(config: Config, store: Arc<S>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let links = config.links.iter().map(Link::from_config).collect();
        let na = Arc::new(BindingManager::new(IaType::Na, &config, Arc::clone(&store)).await?);
        let ta = Arc::new(BindingManager::new(IaType::Ta, &config, Arc::clone(&store)).await?);
        let pd = Arc::new(BindingManager::new(IaType::Pd, &config, Arc::clone(&store)).await?);
        let v4 = Arc::new(BindingManager::new(IaType::V4, &config, Arc::clone(&store)).await?);

        info!("Binding engine ready with {} link(s)", config.links.len());

        Ok(Self {
            config,
            links,
            store,
            na,
            ta,
            pd,
            v4,
            reaper: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The manager serving an IA type.
    pub fn manager(&self, ia_type: IaType) -> &Arc<BindingManager<S>> {
        match ia_type {
            IaType::Na => &self.na,
            IaType::Ta => &self.ta,
            IaType::Pd => &self.pd,
            IaType::V4 => &self.v4,
        }
    }

    fn managers(&self) -> Vec<Arc<BindingManager<S>>> {
        [&self.na, &self.ta, &self.pd, &self.v4]
            .into_iter()
            .map(Arc::clone)
            .collect()
    }

    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|link| link.name() == name)
    }

    /// The link whose subnets contain `address`.
    pub fn find_link_by_address(&self, address: IpAddr) -> Option<&Link> {
        self.links.iter().find(|link| link.contains(address))
    }

    /// Resolves the link a request arrived on from its link address.
    ///
    /// A request without a link address resolves only when a single link
    /// is configured.
    pub fn find_link(&self, request: &Request) -> Option<&Link> {
        match request.link_address {
            Some(address) => self.find_link_by_address(address),
            None if self.links.len() == 1 => self.links.first(),
            None => None,
        }
    }

    /// Starts the background reaper with the configured delay and interval.
    /// Does nothing if it is already running.
    pub fn start_reaper(&mut self) {
        if self.reaper.is_some() {
            return;
        }
        let policies = &self.config.policies;
        self.reaper = Some(Reaper::start(
            self.managers(),
            Duration::from_secs(policies.reaper_startup_delay_seconds),
            Duration::from_secs(policies.reaper_interval_seconds),
        ));
    }

    /// Runs one reaper pass now, returning the number of leases expired.
    pub async fn reap_now(&self) -> usize {
        reaper::run_once(&self.managers()).await
    }

    /// Usage of every pool, grouped by IA type.
    pub fn stats(&self) -> Vec<(IaType, PoolUsage)> {
        [IaType::Na, IaType::Ta, IaType::Pd, IaType::V4]
            .into_iter()
            .flat_map(|ia_type| {
                self.manager(ia_type)
                    .stats()
                    .into_iter()
                    .map(move |usage| (ia_type, usage))
            })
            .collect()
    }

    /// Stops the reaper and flushes the lease store.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(reaper) = self.reaper.take() {
            reaper.stop().await;
        }
        if let Err(error) = self.store.flush().await {
            error!("Failed to flush leases on shutdown: {}", error);
            return Err(error);
        }
        info!("Binding engine stopped");
        Ok(())
    }
}
