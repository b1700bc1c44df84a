//! Address Manager
//!
//! The shared table of every peer address the seeder knows about, keyed
//! by IP. Crawl workers and the DNS responder read and mutate it
//! concurrently; a single readers-writer lock guards the indices and no
//! guard is ever held across an await point.
//!
//! Peers are never deleted. They move between derived states instead:
//!
//! ```text
//! new ──attempt──► tried-failing ──good──► good ──1h without success──► stale
//! ```

pub mod snapshot;

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::types::{IpFamily, NetAddress, ServiceFlags, SubnetworkId};

/// Hard cap on table size. Inserts beyond it are dropped silently.
pub const MAX_ADDRESSES: usize = 50_000;

/// Minimum interval between dial attempts against one address.
pub const RETRY_INTERVAL_SECS: u64 = 60;

/// How long an address handed to a crawl batch stays reserved when the
/// worker never reports back.
pub const IN_FLIGHT_TIMEOUT_SECS: u64 = 60;

/// A peer is good while its last successful handshake is younger than this.
pub const GOOD_HORIZON_SECS: u64 = 3_600;

/// Derived per-address state, a pure function of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    New,
    TriedFailing,
    Good,
    Stale,
}

/// One known peer address with its crawl history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: NetAddress,
    /// Services from the last successful version exchange, zero before.
    pub services: ServiceFlags,
    /// Subnetwork from the last successful version exchange.
    pub subnetwork_id: Option<SubnetworkId>,
    pub first_seen: u64,
    /// Unix seconds of the last dial attempt, zero if never dialed.
    pub last_attempt: u64,
    /// Unix seconds of the last successful handshake, zero if never.
    pub last_success: u64,
}

impl AddressEntry {
    fn new(addr: NetAddress, now: u64) -> Self {
        Self {
            addr,
            services: ServiceFlags::NONE,
            subnetwork_id: None,
            first_seen: now,
            last_attempt: 0,
            last_success: 0,
        }
    }

    pub fn state(&self, now: u64) -> AddressState {
        if self.last_success != 0 {
            if now.saturating_sub(self.last_success) < GOOD_HORIZON_SECS {
                AddressState::Good
            } else {
                AddressState::Stale
            }
        } else if self.last_attempt != 0 {
            AddressState::TriedFailing
        } else {
            AddressState::New
        }
    }
}

struct Inner {
    entries: HashMap<Ipv6Addr, AddressEntry>,
    /// IPs handed out by `addresses()` that no worker has reported on yet,
    /// with the time they were handed out.
    in_flight: HashMap<Ipv6Addr, u64>,
}

/// The concurrency-safe address table.
pub struct AddressManager {
    inner: RwLock<Inner>,
    snapshot_path: PathBuf,
    metrics: Arc<Metrics>,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl AddressManager {
    /// Create the manager, hydrating from the snapshot file if one exists
    /// and decodes. A corrupt or mismatched snapshot is discarded.
    pub fn new(snapshot_path: PathBuf, metrics: Arc<Metrics>) -> Self {
        let mut entries = HashMap::new();
        if snapshot_path.exists() {
            match snapshot::load(&snapshot_path) {
                Ok(loaded) => {
                    for entry in loaded.into_iter().take(MAX_ADDRESSES) {
                        entries.insert(entry.addr.ip, entry);
                    }
                    info!("loaded {} addresses from {:?}", entries.len(), snapshot_path);
                }
                Err(e) => {
                    warn!("discarding address snapshot {:?}: {}", snapshot_path, e);
                }
            }
        }

        Self {
            inner: RwLock::new(Inner {
                entries,
                in_flight: HashMap::new(),
            }),
            snapshot_path,
            metrics,
        }
    }

    /// Insert every address whose IP is not yet known. Non-routable
    /// addresses and inserts beyond the cap are dropped. Returns the
    /// number of genuinely new entries.
    pub fn add_addresses(&self, addrs: &[NetAddress]) -> usize {
        self.add_addresses_at(addrs, unix_now())
    }

    fn add_addresses_at(&self, addrs: &[NetAddress], now: u64) -> usize {
        let mut inner = self.inner.write().expect("address table poisoned");
        let mut added = 0;

        for addr in addrs {
            if !addr.is_routable() {
                continue;
            }
            if inner.entries.contains_key(&addr.ip) {
                continue;
            }
            if inner.entries.len() >= MAX_ADDRESSES {
                self.metrics.inc_store_full_drops();
                continue;
            }
            inner.entries.insert(addr.ip, AddressEntry::new(*addr, now));
            added += 1;
        }

        if added > 0 {
            self.metrics.add_addresses_added(added as u64);
        }
        added
    }

    /// Record a dial attempt. Also releases the in-flight reservation:
    /// the retry interval keeps the address out of the next batches.
    pub fn attempt(&self, addr: &NetAddress) {
        self.attempt_at(addr, unix_now());
    }

    fn attempt_at(&self, addr: &NetAddress, now: u64) {
        let mut inner = self.inner.write().expect("address table poisoned");
        inner.in_flight.remove(&addr.ip);
        if let Some(entry) = inner.entries.get_mut(&addr.ip) {
            entry.last_attempt = now;
        }
    }

    /// Record a successful version exchange, creating the entry if the
    /// peer was previously unknown.
    pub fn good(&self, addr: &NetAddress, services: ServiceFlags, subnetwork_id: SubnetworkId) {
        self.good_at(addr, services, subnetwork_id, unix_now());
    }

    fn good_at(
        &self,
        addr: &NetAddress,
        services: ServiceFlags,
        subnetwork_id: SubnetworkId,
        now: u64,
    ) {
        let mut inner = self.inner.write().expect("address table poisoned");
        inner.in_flight.remove(&addr.ip);
        let entry = inner
            .entries
            .entry(addr.ip)
            .or_insert_with(|| AddressEntry::new(*addr, now));
        entry.last_attempt = now;
        entry.last_success = now;
        entry.services = services;
        entry.subnetwork_id = Some(subnetwork_id);
    }

    /// The next crawl batch, in randomized order.
    ///
    /// Every returned address is reserved: it will not appear in another
    /// batch until `attempt`/`good` is reported for it or the reservation
    /// times out.
    pub fn addresses(&self) -> Vec<NetAddress> {
        self.addresses_at(unix_now())
    }

    fn addresses_at(&self, now: u64) -> Vec<NetAddress> {
        let mut inner = self.inner.write().expect("address table poisoned");

        inner
            .in_flight
            .retain(|_, handed_out| now.saturating_sub(*handed_out) < IN_FLIGHT_TIMEOUT_SECS);

        let mut batch: Vec<NetAddress> = inner
            .entries
            .values()
            .filter(|e| {
                !inner.in_flight.contains_key(&e.addr.ip)
                    && (e.last_attempt == 0
                        || now.saturating_sub(e.last_attempt) >= RETRY_INTERVAL_SECS)
            })
            .map(|e| e.addr)
            .collect();

        for addr in &batch {
            inner.in_flight.insert(addr.ip, now);
        }
        drop(inner);

        batch.shuffle(&mut rand::thread_rng());
        batch
    }

    pub fn address_count(&self) -> usize {
        self.inner.read().expect("address table poisoned").entries.len()
    }

    /// Addresses currently in the good state, for the status log.
    pub fn good_count(&self) -> usize {
        let now = unix_now();
        let inner = self.inner.read().expect("address table poisoned");
        inner
            .entries
            .values()
            .filter(|e| e.state(now) == AddressState::Good)
            .count()
    }

    /// Uniform random sample, without replacement, of good addresses of
    /// the requested family whose services cover `required` and whose
    /// subnetwork satisfies `filter`.
    pub fn good_addresses(
        &self,
        family: IpFamily,
        required: ServiceFlags,
        filter: Option<SubnetworkId>,
        limit: usize,
    ) -> Vec<NetAddress> {
        self.good_addresses_at(family, required, filter, limit, unix_now())
    }

    fn good_addresses_at(
        &self,
        family: IpFamily,
        required: ServiceFlags,
        filter: Option<SubnetworkId>,
        limit: usize,
        now: u64,
    ) -> Vec<NetAddress> {
        if limit == 0 {
            return Vec::new();
        }

        let mut qualifying: Vec<NetAddress> = {
            let inner = self.inner.read().expect("address table poisoned");
            inner
                .entries
                .values()
                .filter(|e| {
                    e.state(now) == AddressState::Good
                        && e.addr.family() == family
                        && e.services.has(required)
                        && match &e.subnetwork_id {
                            Some(id) => id.matches(filter.as_ref()),
                            None => filter.is_none(),
                        }
                })
                .map(|e| e.addr)
                .collect()
        };

        qualifying.shuffle(&mut rand::thread_rng());
        qualifying.truncate(limit);
        qualifying
    }

    /// Clone of every entry, for snapshotting outside the lock.
    pub fn snapshot_entries(&self) -> Vec<AddressEntry> {
        let inner = self.inner.read().expect("address table poisoned");
        inner.entries.values().cloned().collect()
    }

    /// Write the snapshot file now.
    pub fn persist(&self) -> anyhow::Result<()> {
        let entries = self.snapshot_entries();
        match snapshot::save(&self.snapshot_path, &entries) {
            Ok(()) => {
                self.metrics.inc_snapshots_written();
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_snapshot_failures();
                Err(e)
            }
        }
    }
}
