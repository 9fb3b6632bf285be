//! Binding managers: pool selection, allocation and lease lifecycle.
//!
//! One [`BindingManager`] exists per IA type (IA_NA, IA_TA, IA_PD and
//! DHCPv4). It owns the pools and static bindings of its type on every
//! link and implements the operations the protocol layer calls:
//!
//! - `find_current_binding` - rehydrate a stored binding
//! - `create_binding` - first contact
//! - `update_binding` - renew, rebind, request
//! - `release_binding` / `decline_binding` - client gives the address back
//! - `expire_lease` / `reap` - reaper callbacks
//!
//! # Allocation order
//!
//! Static bindings win over everything. Otherwise client hints are honored
//! when a pool on the link owns them and no other client holds them; a hint
//! held by someone else is discarded without error. With no usable hint
//! the manager takes the next free unit from the link's pools (filtered
//! pools whose filter matches first, then unfiltered pools, each in
//! configured order). When every pool is exhausted, the oldest unused
//! stored lease in those pools is deleted and its address reused; that
//! step runs under a manager-wide lock so two requests cannot pick the same
//! lease.
//!
//! # Thread Safety
//!
//! All operations take `&self`. Allocator bitmaps sit behind per-pool
//! mutexes; the reuse step uses a [`tokio::sync::Mutex`]. Writes for one
//! identity are serialized by the [`LeaseStore`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::binding::{
    Binding, BindingObject, BindingSource, IaType, IdentityKey, LeaseState, Lifetime,
    set_binding_object_times,
};
use crate::config::{Config, LinkConfig, Policies};
use crate::error::{Error, Result};
use crate::link::Link;
use crate::pool::{
    AddressBindingPool, BindingPool, PoolStats, PrefixBindingPool, V4BindingPool,
};
use crate::range::AddressRange;
use crate::request::Request;
use crate::static_binding::StaticBinding;
use crate::store::{Lease, LeaseChanges, LeaseStore};

/// Usage of one pool, for reporting.
#[derive(Debug, Clone)]
pub struct PoolUsage {
    pub link: String,
    pub range: AddressRange,
    pub stats: PoolStats,
}

/// An address claimed for a binding during one request.
struct Claim {
    pool: Arc<dyn BindingPool>,
    address: IpAddr,
    /// False when the address was already held by the same client and
    /// must not be freed if persisting fails.
    fresh: bool,
}

/// The pools and static bindings of one IA type on one link.
#[derive(Debug, Default)]
struct LinkBindings {
    /// Pools with a link filter, in configured order.
    filtered_pools: Vec<Arc<dyn BindingPool>>,
    /// Pools without a link filter, in configured order.
    unfiltered_pools: Vec<Arc<dyn BindingPool>>,
    static_bindings: Vec<Arc<StaticBinding>>,
}

impl LinkBindings {
    fn build(ia_type: IaType, link: &LinkConfig, policies: &Policies) -> Result<Self> {
        let mut bindings = LinkBindings::default();

        let filter_for = |name: Option<&String>| {
            name.map(|name| {
                link.filter(name).cloned().map(Arc::new).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "link '{}' has no filter named '{}'",
                        link.name, name
                    ))
                })
            })
            .transpose()
        };

        if ia_type == IaType::Pd {
            for pool in &link.prefix_pools {
                let lifetimes = policies.lifetimes(
                    ia_type,
                    pool.preferred_lifetime_seconds,
                    pool.valid_lifetime_seconds,
                );
                let built = PrefixBindingPool::new(
                    &link.name,
                    pool.prefix,
                    pool.allocation_length,
                    lifetimes,
                    filter_for(pool.filter.as_ref())?,
                    pool.options.clone(),
                )?;
                bindings.push_pool(Arc::new(built));
            }
        } else {
            for pool in link.address_pools_for(ia_type) {
                let range = AddressRange::new(pool.start, pool.end)?;
                let lifetimes = policies.lifetimes(
                    ia_type,
                    pool.preferred_lifetime_seconds,
                    pool.valid_lifetime_seconds,
                );
                let filter = filter_for(pool.filter.as_ref())?;
                let options = pool.options.clone();
                let built: Arc<dyn BindingPool> = if ia_type == IaType::V4 {
                    Arc::new(V4BindingPool::new(&link.name, range, lifetimes.1, filter, options)?)
                } else {
                    Arc::new(AddressBindingPool::new(
                        &link.name, range, lifetimes, filter, options,
                    )?)
                };
                bindings.push_pool(built);
            }
        }

        for config in link.static_bindings.iter().filter(|s| s.ia_type == ia_type) {
            let binding = StaticBinding::from_config(&link.name, config, policies)?;
            bindings.static_bindings.push(Arc::new(binding));
        }

        Ok(bindings)
    }

    fn push_pool(&mut self, pool: Arc<dyn BindingPool>) {
        if pool.link_filter().is_some() {
            self.filtered_pools.push(pool);
        } else {
            self.unfiltered_pools.push(pool);
        }
    }

    fn pools(&self) -> impl Iterator<Item = &Arc<dyn BindingPool>> {
        self.filtered_pools.iter().chain(&self.unfiltered_pools)
    }

    /// Pools a request may allocate from, in trial order.
    fn candidate_pools(&self, request: &Request) -> Vec<Arc<dyn BindingPool>> {
        self.filtered_pools
            .iter()
            .filter(|pool| pool.accepts(request))
            .chain(&self.unfiltered_pools)
            .cloned()
            .collect()
    }

    /// The pool owning `address`, honoring link filters when a request is given.
    fn find_pool(
        &self,
        address: IpAddr,
        request: Option<&Request>,
    ) -> Option<&Arc<dyn BindingPool>> {
        self.pools().find(|pool| {
            pool.contains(address) && request.is_none_or(|request| pool.accepts(request))
        })
    }

    fn find_static(&self, key: &IdentityKey, request: &Request) -> Option<&Arc<StaticBinding>> {
        self.static_bindings
            .iter()
            .find(|binding| binding.matches(key, request))
    }
}

/// Orchestrates allocation and lease lifecycle for one IA type.
#[derive(Debug)]
pub struct BindingManager<S> {
    ia_type: IaType,
    store: Arc<S>,
    links: HashMap<String, LinkBindings>,
    policies: Policies,
    /// Serializes the reuse-oldest step across all pools.
    reuse_lock: Mutex<()>,
}

impl<S: LeaseStore> BindingManager<S> {
    /// Builds the pools for `ia_type` on every configured link and
    /// reconciles them with the leases already in the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any pool cannot be built, or a
    /// store error if reconciliation fails.
    pub async fn new(ia_type: IaType, config: &Config, store: Arc<S>) -> Result<Self> {
        let mut links = HashMap::new();
        for link in &config.links {
            links.insert(
                link.name.clone(),
                LinkBindings::build(ia_type, link, &config.policies)?,
            );
        }

        let manager = Self {
            ia_type,
            store,
            links,
            policies: config.policies.clone(),
            reuse_lock: Mutex::new(()),
        };

        manager.reserve_static_addresses().await?;
        if manager.policies.reconcile_on_startup {
            manager.reconcile().await?;
        }

        let pool_count: usize = manager
            .links
            .values()
            .map(|bindings| bindings.pools().count())
            .sum();
        info!(
            "{} binding manager ready: {} pool(s) on {} link(s)",
            ia_type,
            pool_count,
            manager.links.len()
        );

        Ok(manager)
    }

    pub fn ia_type(&self) -> IaType {
        self.ia_type
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The pools of this IA type on a link, filtered pools first.
    pub fn pools(&self, link: &Link) -> Vec<Arc<dyn BindingPool>> {
        self.links
            .get(link.name())
            .map(|bindings| bindings.pools().cloned().collect())
            .unwrap_or_default()
    }

    /// Usage counters for every pool of this manager.
    pub fn stats(&self) -> Vec<PoolUsage> {
        let mut usage: Vec<PoolUsage> = self
            .links
            .values()
            .flat_map(|bindings| bindings.pools())
            .map(|pool| PoolUsage {
                link: pool.link_name().to_string(),
                range: pool.range(),
                stats: pool.stats(),
            })
            .collect();
        usage.sort_by(|a, b| a.link.cmp(&b.link));
        usage
    }

    fn link_bindings(&self, link: &Link) -> Result<&LinkBindings> {
        self.links
            .get(link.name())
            .ok_or_else(|| Error::UnknownLink(link.name().to_string()))
    }

    /// Static addresses inside a dynamic pool must never be handed out.
    /// Marks static addresses used in any pool that contains them.
    ///
    /// A dynamic lease still recorded on a static address blocks that static
    /// binding until the lease is released, expired or deleted.
    async fn reserve_static_addresses(&self) -> Result<()> {
        for (name, bindings) in &self.links {
            for binding in &bindings.static_bindings {
                if let Some(pool) = bindings.find_pool(binding.address(), None) {
                    debug!(
                        "Reserving static address {} in pool {}",
                        binding.leased,
                        pool.range()
                    );
                    pool.set_used(pool.canonical_address(binding.address()));
                }

                if let Some(lease) = self.store.find_lease_by_address(binding.address()).await?
                    && lease.state.holds_address()
                    && lease.state != LeaseState::Static
                {
                    warn!(
                        "Static address {} on link {} is still leased to {} ({})",
                        binding.leased,
                        name,
                        lease.identity(),
                        lease.state
                    );
                }
            }
        }
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        for (name, bindings) in &self.links {
            for pool in bindings.pools() {
                let leases = self
                    .store
                    .find_leases_in_range(self.ia_type, pool.range())
                    .await?;
                let mut count = 0usize;
                let held = leases.iter().filter(|lease| {
                    lease.state.holds_address() && lease.state != LeaseState::Static
                });
                for lease in held {
                    pool.set_used(lease.address);
                    count += 1;
                }
                if count > 0 {
                    info!(
                        "Reconciled {} stored lease(s) into pool {} on link {}",
                        count,
                        pool.range(),
                        name
                    );
                }
            }
        }
        Ok(())
    }

    /// Finds the static binding that applies to this client, if any.
    pub fn find_static_binding(
        &self,
        link: &Link,
        key: &IdentityKey,
        request: &Request,
    ) -> Option<Arc<StaticBinding>> {
        self.links
            .get(link.name())
            .and_then(|bindings| bindings.find_static(key, request))
            .cloned()
    }

    /// Loads the client's current binding from the store.
    ///
    /// Only leases in a live state (advertised, committed, static) are
    /// rehydrated. Each is re-associated with the pool or static binding
    /// that owns its address now, and that pool's allocator marks it used.
    /// A lease no pool owns any more is logged and left out.
    ///
    /// Returns `None` if the client has no live lease.
    pub async fn find_current_binding(
        &self,
        link: &Link,
        key: &IdentityKey,
        _request: &Request,
    ) -> Result<Option<Binding>> {
        let bindings = self.link_bindings(link)?;
        let live: Vec<Lease> = self
            .store
            .find_leases(key)
            .await?
            .into_iter()
            .filter(|lease| lease.state.is_live())
            .collect();

        let Some(first) = live.first() else {
            return Ok(None);
        };
        let state = if live.iter().any(|lease| lease.state == LeaseState::Committed) {
            LeaseState::Committed
        } else {
            first.state
        };

        let mut binding = Binding::new(key.clone(), link.name(), state);
        for lease in &live {
            match self.rehydrate(bindings, lease) {
                Some(object) => binding.objects.push(object),
                None => error!(
                    "Lease {} of {} on link {} matches no pool or static binding, dropping it",
                    lease.address,
                    key,
                    link.name()
                ),
            }
        }

        Ok(Some(binding))
    }

    fn rehydrate(&self, bindings: &LinkBindings, lease: &Lease) -> Option<BindingObject> {
        let (leased, source) = if lease.state == LeaseState::Static {
            let binding = bindings
                .static_bindings
                .iter()
                .find(|binding| binding.address() == lease.address)?;
            (binding.leased, BindingSource::Static(Arc::clone(binding)))
        } else {
            let pool = bindings.find_pool(lease.address, None)?;
            pool.set_used(lease.address);
            (pool.leased(lease.address), BindingSource::Pool(Arc::clone(pool)))
        };

        Some(BindingObject {
            leased,
            state: lease.state,
            start_time: lease.start_time,
            preferred_end_time: lease.preferred_end_time,
            valid_end_time: lease.valid_end_time,
            source,
        })
    }

    /// Creates a binding for a client without a current one.
    ///
    /// Returns `Ok(None)` when no address is available.
    ///
    /// # Errors
    ///
    /// Returns the store error if the binding cannot be persisted; every
    /// address claimed for it is returned to its pool first.
    pub async fn create_binding(
        &self,
        link: &Link,
        key: &IdentityKey,
        hints: &[IpAddr],
        request: &Request,
        state: LeaseState,
    ) -> Result<Option<Binding>> {
        let bindings = self.link_bindings(link)?;

        if let Some(static_binding) = bindings.find_static(key, request) {
            let binding = self.static_binding_for(key, link, static_binding);
            if let Err(error) = self.store.create_leases(binding.to_leases()).await {
                error!("Failed to persist static binding for {}: {}", key, error);
                return Err(error);
            }
            info!("Static binding {} for {}", static_binding.leased, key);
            return Ok(Some(binding));
        }

        let claims = self.resolve_addresses(bindings, key, hints, request).await?;
        if claims.is_empty() {
            warn!(
                "No {} addresses available for {} on link {}",
                self.ia_type,
                key,
                link.name()
            );
            return Ok(None);
        }

        let mut binding = Binding::new(key.clone(), link.name(), state);
        binding.objects = Self::objects_for(&claims, state);

        if let Err(error) = self.store.create_leases(binding.to_leases()).await {
            error!("Failed to persist binding for {}: {}", key, error);
            Self::release_claims(&claims);
            return Err(error);
        }

        info!(
            "{} {} to {} on link {}",
            state,
            display_addresses(&binding),
            key,
            link.name()
        );
        Ok(Some(binding))
    }

    /// Updates a client's existing binding (renew, rebind, request).
    ///
    /// A binding with objects keeps them and only has their lifetimes
    /// refreshed and state set. An empty binding, left behind when every
    /// lease was reclaimed, gets fresh addresses as in
    /// [`create_binding`](Self::create_binding).
    pub async fn update_binding(
        &self,
        binding: Binding,
        link: &Link,
        key: &IdentityKey,
        hints: &[IpAddr],
        request: &Request,
        state: LeaseState,
    ) -> Result<Option<Binding>> {
        let bindings = self.link_bindings(link)?;

        if let Some(static_binding) = bindings.find_static(key, request) {
            return self
                .update_static_binding(binding, link, key, static_binding)
                .await
                .map(Some);
        }

        let mut binding = binding;
        if binding.is_empty() {
            let claims = self.resolve_addresses(bindings, key, hints, request).await?;
            if claims.is_empty() {
                warn!(
                    "No {} addresses available for {} on link {}",
                    self.ia_type,
                    key,
                    link.name()
                );
                return Ok(None);
            }
            binding.state = state;
            binding.objects = Self::objects_for(&claims, state);

            let changes = LeaseChanges {
                added: binding.to_leases(),
                ..Default::default()
            };
            if let Err(error) = self.store.update_leases(changes).await {
                error!("Failed to persist new leases for {}: {}", key, error);
                Self::release_claims(&claims);
                return Err(error);
            }
            info!("{} {} to {} (rebuilt)", state, display_addresses(&binding), key);
            return Ok(Some(binding));
        }

        for object in &mut binding.objects {
            let (preferred, valid) = object_lifetimes(object);
            object.state = if object.is_static() {
                LeaseState::Static
            } else {
                state
            };
            set_binding_object_times(object, preferred, valid);
        }
        binding.state = state;

        let changes = LeaseChanges {
            updated: binding.to_leases(),
            ..Default::default()
        };
        if let Err(error) = self.store.update_leases(changes).await {
            error!("Failed to persist updated binding for {}: {}", key, error);
            return Err(error);
        }

        debug!("Refreshed {} for {}", display_addresses(&binding), key);
        Ok(Some(binding))
    }

    async fn update_static_binding(
        &self,
        binding: Binding,
        link: &Link,
        key: &IdentityKey,
        static_binding: &Arc<StaticBinding>,
    ) -> Result<Binding> {
        let updated = self.static_binding_for(key, link, static_binding);
        let stale: Vec<&BindingObject> = binding
            .objects
            .iter()
            .filter(|object| object.address() != static_binding.address())
            .collect();

        let changes = LeaseChanges {
            updated: updated.to_leases(),
            deleted: stale
                .iter()
                .map(|object| object.to_lease(&binding.key, &binding.link))
                .collect(),
            ..Default::default()
        };
        let removed = match self.store.update_leases(changes).await {
            Ok(removed) => removed,
            Err(error) => {
                error!("Failed to persist static binding for {}: {}", key, error);
                return Err(error);
            }
        };

        for object in stale {
            if let Some(pool) = object.pool()
                && removed.contains(&object.address())
            {
                pool.set_free(object.address());
            }
            info!(
                "Replaced {} with static binding {} for {}",
                object.leased, static_binding.leased, key
            );
        }
        Ok(updated)
    }

    fn static_binding_for(
        &self,
        key: &IdentityKey,
        link: &Link,
        static_binding: &Arc<StaticBinding>,
    ) -> Binding {
        let mut object = BindingObject::new(
            static_binding.leased,
            LeaseState::Static,
            BindingSource::Static(Arc::clone(static_binding)),
        );
        set_binding_object_times(
            &mut object,
            static_binding.preferred_lifetime,
            static_binding.valid_lifetime,
        );
        let mut binding = Binding::new(key.clone(), link.name(), LeaseState::Static);
        binding.objects.push(object);
        binding
    }

    fn objects_for(claims: &[Claim], state: LeaseState) -> Vec<BindingObject> {
        claims
            .iter()
            .map(|claim| {
                let mut object = BindingObject::new(
                    claim.pool.leased(claim.address),
                    state,
                    BindingSource::Pool(Arc::clone(&claim.pool)),
                );
                set_binding_object_times(
                    &mut object,
                    claim.pool.preferred_lifetime(),
                    claim.pool.valid_lifetime(),
                );
                object
            })
            .collect()
    }

    fn release_claims(claims: &[Claim]) {
        for claim in claims.iter().filter(|claim| claim.fresh) {
            claim.pool.set_free(claim.address);
        }
    }

    /// Turns client hints into claimed addresses, falling back to the
    /// next-free algorithm when no hint is usable.
    async fn resolve_addresses(
        &self,
        bindings: &LinkBindings,
        key: &IdentityKey,
        hints: &[IpAddr],
        request: &Request,
    ) -> Result<Vec<Claim>> {
        let mut claims: Vec<Claim> = Vec::new();

        for &hint in hints {
            let Some(pool) = bindings.find_pool(hint, Some(request)) else {
                debug!("Ignoring hint {} from {}: no pool on the link owns it", hint, key);
                continue;
            };
            let address = pool.canonical_address(hint);
            if claims.iter().any(|claim| claim.address == address) {
                continue;
            }

            let existing = match self.store.find_lease_by_address(address).await {
                Ok(existing) => existing,
                Err(error) => {
                    Self::release_claims(&claims);
                    return Err(error);
                }
            };
            let fresh = match existing {
                Some(lease) if lease.state.holds_address() => {
                    if lease.identity() == *key && lease.state.is_live() {
                        pool.set_used(address);
                        false
                    } else {
                        debug!(
                            "Ignoring hint {} from {}: held by {} ({})",
                            address,
                            key,
                            lease.identity(),
                            lease.state
                        );
                        continue;
                    }
                }
                _ => {
                    if !pool.try_claim(address) {
                        debug!("Ignoring hint {} from {}: already in use", address, key);
                        continue;
                    }
                    true
                }
            };
            claims.push(Claim {
                pool: Arc::clone(pool),
                address,
                fresh,
            });
        }

        if claims.is_empty()
            && let Some(claim) = self.next_free_address(bindings, key, request).await?
        {
            claims.push(claim);
        }
        Ok(claims)
    }

    /// The next-free algorithm: a virgin unit from the candidate pools,
    /// else the oldest reusable lease in them.
    async fn next_free_address(
        &self,
        bindings: &LinkBindings,
        key: &IdentityKey,
        request: &Request,
    ) -> Result<Option<Claim>> {
        let pools = bindings.candidate_pools(request);

        for pool in &pools {
            while let Some(address) = pool.next_available_address() {
                match self.store.find_lease_by_address(address).await {
                    Ok(Some(lease))
                        if lease.state.holds_address()
                            && (lease.identity() != *key || !lease.state.is_live()) =>
                    {
                        // Left marked used; the holder's lease is the truth.
                        warn!(
                            "Address {} was free in pool {} but is held by {}",
                            address,
                            pool.range(),
                            lease.identity()
                        );
                    }
                    Ok(_) => {
                        return Ok(Some(Claim {
                            pool: Arc::clone(pool),
                            address,
                            fresh: true,
                        }));
                    }
                    Err(error) => {
                        pool.set_free(address);
                        return Err(error);
                    }
                }
            }
        }

        for pool in &pools {
            if let Some(address) = self.reuse_oldest(pool).await? {
                return Ok(Some(Claim {
                    pool: Arc::clone(pool),
                    address,
                    fresh: true,
                }));
            }
        }

        Ok(None)
    }

    /// Takes over the oldest lease in `pool` that no active client holds.
    async fn reuse_oldest(&self, pool: &Arc<dyn BindingPool>) -> Result<Option<IpAddr>> {
        let _guard = self.reuse_lock.lock().await;

        let now = Utc::now();
        let candidates = self
            .store
            .find_unused_leases(self.ia_type, pool.range(), now, self.offer_cutoff(now))
            .await?;

        for lease in candidates {
            let address = lease.address;
            if !pool.contains(address) {
                continue;
            }
            // A stale live lease still owns its bit; a released or expired
            // one gave it back and must be claimed like any free unit.
            let held = lease.state.holds_address();
            if held {
                pool.set_used(address);
            } else if !pool.try_claim(address) {
                continue;
            }

            if let Err(error) = self.store.delete_lease(&lease).await {
                if !held {
                    pool.set_free(address);
                }
                return Err(error);
            }
            info!(
                "Reusing {} from {} lease of {} in pool {}",
                address,
                lease.state,
                lease.identity(),
                pool.range()
            );
            return Ok(Some(address));
        }

        Ok(None)
    }

    fn offer_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.policies.offer_expiration_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|expiration| now.checked_sub_signed(expiration))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Releases every object of the binding back to its pool.
    pub async fn release_binding(&self, binding: Binding) -> Result<Binding> {
        self.finish_binding(binding, LeaseState::Released, self.policies.delete_released)
            .await
    }

    /// Marks every object of the binding declined and frees it in its pool.
    pub async fn decline_binding(&self, binding: Binding) -> Result<Binding> {
        self.finish_binding(binding, LeaseState::Declined, self.policies.delete_declined)
            .await
    }

    async fn finish_binding(
        &self,
        mut binding: Binding,
        state: LeaseState,
        delete: bool,
    ) -> Result<Binding> {
        for object in &mut binding.objects {
            object.state = state;
            object.clear_times();
        }
        binding.state = state;

        let leases = binding.to_leases();
        let changes = if delete {
            LeaseChanges {
                deleted: leases,
                ..Default::default()
            }
        } else {
            LeaseChanges {
                updated: leases,
                ..Default::default()
            }
        };
        let removed = if changes.is_empty() {
            Vec::new()
        } else {
            match self.store.update_leases(changes).await {
                Ok(removed) => removed,
                Err(error) => {
                    error!("Failed to persist {} binding for {}: {}", state, binding.key, error);
                    return Err(error);
                }
            }
        };

        for object in &binding.objects {
            let Some(pool) = object.pool() else {
                continue;
            };
            if delete && !removed.contains(&object.address()) {
                // Reclaimed and possibly reassigned since the client saw it.
                debug!(
                    "{} is no longer recorded for {}; pool state left as is",
                    object.address(),
                    binding.key
                );
                continue;
            }
            pool.set_free(object.address());
        }

        info!("{} {} for {}", state, display_addresses(&binding), binding.key);
        Ok(binding)
    }

    /// Expires one lease whose valid lifetime has ended.
    ///
    /// Re-reads the lease first; if it is gone, no longer live, or was
    /// renewed in the meantime, nothing happens and `Ok(false)` is returned.
    pub async fn expire_lease(&self, lease: &Lease) -> Result<bool> {
        let current = self
            .store
            .find_leases(&lease.identity())
            .await?
            .into_iter()
            .find(|stored| stored.address == lease.address);

        let Some(mut current) = current else {
            return Ok(false);
        };
        if !matches!(current.state, LeaseState::Advertised | LeaseState::Committed)
            || !current.is_expired_at(Utc::now())
        {
            return Ok(false);
        }

        current.state = LeaseState::Expired;
        current.start_time = None;
        current.preferred_end_time = None;
        current.valid_end_time = None;

        if self.policies.delete_expired {
            if !self.store.delete_lease(&current).await? {
                return Ok(false);
            }
        } else {
            let changes = LeaseChanges {
                updated: vec![current.clone()],
                ..Default::default()
            };
            self.store.update_leases(changes).await?;
        }

        match self.pool_for(&current.link, current.address) {
            Some(pool) => pool.set_free(current.address),
            None => warn!(
                "Expired lease {} on link {} matches no configured pool",
                current.address, current.link
            ),
        }

        debug!("Expired {} of {}", current.address, current.identity());
        Ok(true)
    }

    /// One reaper pass: expires every lease whose valid lifetime has ended.
    ///
    /// Returns the number of leases expired. Failures on individual leases
    /// are logged and skipped.
    pub async fn reap(&self) -> Result<usize> {
        let expired = self
            .store
            .find_expired_leases(self.ia_type, Utc::now())
            .await?;

        let mut count = 0;
        for lease in &expired {
            match self.expire_lease(lease).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(error) => warn!("Failed to expire lease {}: {}", lease.address, error),
            }
        }

        if count > 0 {
            info!("Expired {} {} lease(s)", count, self.ia_type);
        }
        Ok(count)
    }

    fn pool_for(&self, link: &str, address: IpAddr) -> Option<&Arc<dyn BindingPool>> {
        self.links
            .get(link)
            .and_then(|bindings| bindings.find_pool(address, None))
            .or_else(|| {
                self.links
                    .values()
                    .find_map(|bindings| bindings.find_pool(address, None))
            })
    }
}

fn object_lifetimes(object: &BindingObject) -> (Lifetime, Lifetime) {
    match &object.source {
        BindingSource::Pool(pool) => (pool.preferred_lifetime(), pool.valid_lifetime()),
        BindingSource::Static(binding) => (binding.preferred_lifetime, binding.valid_lifetime),
    }
}

fn display_addresses(binding: &Binding) -> String {
    binding
        .objects
        .iter()
        .map(|object| object.leased.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
