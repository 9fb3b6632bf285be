//! Lease persistence.
//!
//! The engine talks to storage only through the narrow [`LeaseStore`]
//! trait: lookups by identity, by address and by address range, and
//! create/update/delete operations that must each be atomic for one
//! identity. [`FileLeaseStore`] implements it as an in-memory table that is
//! optionally persisted to a JSON file.
//!
//! # Address ownership
//!
//! The address is the primary key of a stored lease. Recording a lease for
//! an address whose current record is in a state that holds the address
//! (see [`LeaseState::holds_address`]) fails with
//! [`Error::AddressConflict`] unless the record belongs to the same
//! identity; records in `released` or `expired` state are replaced.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::binding::{Duid, IaType, IdentityKey, LeaseState};
use crate::error::{Error, Result};
use crate::range::AddressRange;

/// Minimum interval between lease file saves (5 seconds).
///
/// Prevents excessive disk I/O when handling many requests. The dirty flag
/// is checked and cleared on each save; [`LeaseStore::flush`] forces one.
const SAVE_INTERVAL: Duration = Duration::from_millis(5000);

/// A persisted lease: one leased address or prefix of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub duid: Duid,
    pub ia_type: IaType,
    pub iaid: u32,
    /// Name of the link the lease was made on.
    pub link: String,
    /// The address, or the base address of a delegated prefix.
    pub address: IpAddr,
    pub prefix_len: u8,
    pub state: LeaseState,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub preferred_end_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub valid_end_time: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(self.duid.clone(), self.ia_type, self.iaid)
    }

    fn belongs_to(&self, key: &IdentityKey) -> bool {
        self.duid == key.duid && self.ia_type == key.ia_type && self.iaid == key.iaid
    }

    /// True if the valid lifetime ended at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_end_time.is_some_and(|end| end <= now)
    }

    /// Seconds remaining until the valid lifetime ends, or 0.
    pub fn remaining_seconds(&self) -> i64 {
        self.valid_end_time
            .map(|end| (end - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// True if the lease can be taken over by the reuse-oldest procedure.
    fn is_reusable(&self, now: DateTime<Utc>, offer_cutoff: DateTime<Utc>) -> bool {
        match self.state {
            LeaseState::Released | LeaseState::Expired => true,
            LeaseState::Advertised => {
                self.is_expired_at(now) || self.start_time.is_none_or(|start| start <= offer_cutoff)
            }
            LeaseState::Committed => self.is_expired_at(now),
            LeaseState::Declined | LeaseState::Static => false,
        }
    }
}

/// An incremental change to one identity's stored leases.
#[derive(Debug, Clone, Default)]
pub struct LeaseChanges {
    pub added: Vec<Lease>,
    pub updated: Vec<Lease>,
    pub deleted: Vec<Lease>,
}

impl LeaseChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Storage consumed by the binding managers.
///
/// Every write must be atomic with respect to a single identity.
pub trait LeaseStore: Send + Sync + 'static {
    /// All leases of one identity.
    fn find_leases(
        &self,
        key: &IdentityKey,
    ) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// The lease recorded for an address, if any.
    fn find_lease_by_address(
        &self,
        address: IpAddr,
    ) -> impl Future<Output = Result<Option<Lease>>> + Send;

    /// Leases of an IA type whose address lies in `range`.
    fn find_leases_in_range(
        &self,
        ia_type: IaType,
        range: AddressRange,
    ) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// Leases in `range` no active client holds, oldest valid-end first.
    ///
    /// Covers released and expired records, offers started at or before
    /// `offer_cutoff`, and live leases whose valid lifetime ended by `now`.
    fn find_unused_leases(
        &self,
        ia_type: IaType,
        range: AddressRange,
        now: DateTime<Utc>,
        offer_cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// Advertised or committed leases whose valid lifetime ended by `now`.
    fn find_expired_leases(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    fn create_leases(&self, leases: Vec<Lease>) -> impl Future<Output = Result<()>> + Send;

    /// Applies one identity's changes in a single step.
    ///
    /// A deleted lease is only removed while its address is still recorded
    /// for the lease's identity. Returns the addresses that were removed.
    fn update_leases(
        &self,
        changes: LeaseChanges,
    ) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;

    /// Deletes the record for `lease.address` if it still belongs to the
    /// lease's identity. Returns whether a record was removed.
    fn delete_lease(&self, lease: &Lease) -> impl Future<Output = Result<bool>> + Send;

    fn list_leases(&self) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// Forces pending writes to durable storage.
    fn flush(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Internal mutable state protected by RwLock.
#[derive(Debug)]
struct StoreState {
    /// Leases by address.
    leases: BTreeMap<IpAddr, Lease>,
    /// Reverse lookup: identity → addresses.
    by_identity: HashMap<IdentityKey, BTreeSet<IpAddr>>,
    /// Whether state has changed since last save.
    dirty: bool,
    /// When state was last saved to disk.
    last_save: Instant,
}

impl StoreState {
    fn new() -> Self {
        Self {
            leases: BTreeMap::new(),
            by_identity: HashMap::new(),
            dirty: false,
            last_save: Instant::now(),
        }
    }

    /// Rebuilds the table from a lease file; each address may appear once.
    fn from_leases(leases: Vec<Lease>) -> Result<Self> {
        let mut state = Self::new();
        for lease in leases {
            if state.leases.contains_key(&lease.address) {
                return Err(Error::Store(format!(
                    "lease file records {} more than once",
                    lease.address
                )));
            }
            state.insert(lease);
        }
        state.dirty = false;
        Ok(state)
    }

    fn check_conflict(&self, lease: &Lease) -> Result<()> {
        match self.leases.get(&lease.address) {
            Some(existing)
                if existing.state.holds_address() && !existing.belongs_to(&lease.identity()) =>
            {
                Err(Error::AddressConflict(lease.address))
            }
            _ => Ok(()),
        }
    }

    fn insert(&mut self, lease: Lease) {
        if let Some(previous) = self.leases.get(&lease.address)
            && !previous.belongs_to(&lease.identity())
        {
            let previous = previous.identity();
            self.unindex(&previous, lease.address);
        }
        self.by_identity
            .entry(lease.identity())
            .or_default()
            .insert(lease.address);
        self.leases.insert(lease.address, lease);
        self.dirty = true;
    }

    fn remove(&mut self, lease: &Lease) -> bool {
        let key = lease.identity();
        match self.leases.get(&lease.address) {
            Some(existing) if existing.belongs_to(&key) => {
                self.leases.remove(&lease.address);
                self.unindex(&key, lease.address);
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    fn unindex(&mut self, key: &IdentityKey, address: IpAddr) {
        if let Some(addresses) = self.by_identity.get_mut(key) {
            addresses.remove(&address);
            if addresses.is_empty() {
                self.by_identity.remove(key);
            }
        }
    }

    fn in_range<'a>(
        &'a self,
        ia_type: IaType,
        range: AddressRange,
    ) -> impl Iterator<Item = &'a Lease> + 'a {
        self.leases
            .range(range.start()..=range.end())
            .map(|(_, lease)| lease)
            .filter(move |lease| lease.ia_type == ia_type)
    }
}

/// Lease table kept in memory and optionally persisted to a JSON file.
///
/// All operations are thread-safe. The store uses:
/// - [`RwLock`] for the lease table (allows concurrent reads)
/// - [`Mutex`] for file save operations (prevents corruption)
#[derive(Debug)]
pub struct FileLeaseStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl FileLeaseStore {
    /// A store that never touches the file system.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Opens the lease file at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let leases = Self::load(&path).await?;
        debug!("Loaded {} lease(s) from {}", leases.len(), path.display());
        Ok(Self {
            state: RwLock::new(StoreState::from_leases(leases)?),
            path: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    async fn load(path: &Path) -> Result<Vec<Lease>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Vec::new())
        }
    }

    async fn write_file(&self, leases: Vec<Lease>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _lock = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(&leases)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn maybe_save(&self, state: &mut StoreState) -> Result<()> {
        if self.path.is_some() && state.dirty && state.last_save.elapsed() >= SAVE_INTERVAL {
            let snapshot = state.leases.values().cloned().collect();
            state.dirty = false;
            state.last_save = Instant::now();
            self.write_file(snapshot).await?;
        }
        Ok(())
    }
}

impl LeaseStore for FileLeaseStore {
    async fn find_leases(&self, key: &IdentityKey) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        Ok(state
            .by_identity
            .get(key)
            .map(|addresses| {
                addresses
                    .iter()
                    .filter_map(|address| state.leases.get(address).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_lease_by_address(&self, address: IpAddr) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state.leases.get(&address).cloned())
    }

    async fn find_leases_in_range(
        &self,
        ia_type: IaType,
        range: AddressRange,
    ) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        Ok(state.in_range(ia_type, range).cloned().collect())
    }

    async fn find_unused_leases(
        &self,
        ia_type: IaType,
        range: AddressRange,
        now: DateTime<Utc>,
        offer_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        let mut unused: Vec<Lease> = state
            .in_range(ia_type, range)
            .filter(|lease| lease.is_reusable(now, offer_cutoff))
            .cloned()
            .collect();
        unused.sort_by(|a, b| {
            a.valid_end_time
                .cmp(&b.valid_end_time)
                .then_with(|| a.address.cmp(&b.address))
        });
        Ok(unused)
    }

    async fn find_expired_leases(&self, ia_type: IaType, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        Ok(state
            .leases
            .values()
            .filter(|lease| {
                lease.ia_type == ia_type
                    && matches!(lease.state, LeaseState::Advertised | LeaseState::Committed)
                    && lease.is_expired_at(now)
            })
            .cloned()
            .collect())
    }

    async fn create_leases(&self, leases: Vec<Lease>) -> Result<()> {
        let mut state = self.state.write().await;
        for lease in &leases {
            state.check_conflict(lease)?;
        }
        for lease in leases {
            state.insert(lease);
        }
        self.maybe_save(&mut state).await
    }

    async fn update_leases(&self, changes: LeaseChanges) -> Result<Vec<IpAddr>> {
        let mut state = self.state.write().await;
        for lease in changes.added.iter().chain(&changes.updated) {
            state.check_conflict(lease)?;
        }
        let removed: Vec<IpAddr> = changes
            .deleted
            .iter()
            .filter(|lease| state.remove(lease))
            .map(|lease| lease.address)
            .collect();
        for lease in changes.added.into_iter().chain(changes.updated) {
            state.insert(lease);
        }
        self.maybe_save(&mut state).await?;
        Ok(removed)
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<bool> {
        let mut state = self.state.write().await;
        let removed = state.remove(lease);
        self.maybe_save(&mut state).await?;
        Ok(removed)
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        Ok(state.leases.values().cloned().collect())
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            state.dirty = false;
            state.last_save = Instant::now();
            state.leases.values().cloned().collect()
        };
        self.write_file(snapshot).await
    }
}
