//! Crawl Engine
//!
//! Repeatedly drains candidate batches from the address table and fans
//! out bounded-parallel handshake probes. When the table is empty the
//! configured seed hostnames are resolved first; when there is nothing to
//! crawl at all, the loop idles for ten minutes.

pub mod handshake;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::manager::AddressManager;
use crate::metrics::Metrics;
use crate::netparams::NetworkParams;
use crate::shutdown::Shutdown;
use crate::types::NetAddress;
use handshake::{Handshake, HandshakeEvent};

/// Sleep when the table has nothing eligible to crawl.
pub const IDLE_SLEEP: Duration = Duration::from_secs(600);

/// Hostname resolution capability, injected so tests never hit real DNS.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>>;
}

/// Resolution through the operating system resolver.
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Resolve the configured seed hostnames into dialable addresses on the
/// network's default port. Failures are logged and skipped; the crawl
/// retries after its idle sleep.
pub async fn seed_from_dns(
    seeds: &[&str],
    default_port: u16,
    lookup: &dyn Lookup,
) -> Vec<NetAddress> {
    let mut out = Vec::new();
    for host in seeds {
        match lookup.lookup(host).await {
            Ok(ips) => {
                debug!("seed {} resolved to {} addresses", host, ips.len());
                out.extend(ips.into_iter().map(|ip| NetAddress::new(ip, default_port)));
            }
            Err(e) => warn!("seed {} lookup failed: {}", host, e),
        }
    }
    out
}

/// The long-lived crawl task.
pub struct Crawler<H: Handshake> {
    manager: Arc<AddressManager>,
    handshake: Arc<H>,
    params: &'static NetworkParams,
    metrics: Arc<Metrics>,
    max_probes: usize,
    shutdown: Shutdown,
}

impl<H: Handshake> Crawler<H> {
    pub fn new(
        manager: Arc<AddressManager>,
        handshake: Arc<H>,
        params: &'static NetworkParams,
        metrics: Arc<Metrics>,
        max_probes: usize,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            manager,
            handshake,
            params,
            metrics,
            max_probes,
            shutdown,
        }
    }

    pub async fn run(self, lookup: impl Lookup) {
        let mut shutdown = self.shutdown.clone();

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let mut candidates = self.manager.addresses();
            if candidates.is_empty() && self.manager.address_count() == 0 {
                let seeded =
                    seed_from_dns(self.params.dns_seeds, self.params.default_port, &lookup).await;
                let added = self.manager.add_addresses(&seeded);
                if added > 0 {
                    info!("bootstrap seeded {} addresses", added);
                }
                candidates = self.manager.addresses();
            }

            if candidates.is_empty() {
                info!("no addresses eligible to crawl, sleeping for 10 minutes");
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = shutdown.wait() => break,
                }
                continue;
            }

            let mut workers = JoinSet::new();
            for addr in candidates {
                if shutdown.is_shutdown() {
                    break;
                }
                while workers.len() >= self.max_probes {
                    workers.join_next().await;
                }
                workers.spawn(probe_peer(
                    self.manager.clone(),
                    self.handshake.clone(),
                    self.metrics.clone(),
                    addr,
                ));
            }
            // Let the round finish before drawing the next batch.
            while workers.join_next().await.is_some() {}
        }

        info!("crawler shut down");
    }
}

/// One worker: record the attempt, drive the probe, apply its outcome.
async fn probe_peer<H: Handshake>(
    manager: Arc<AddressManager>,
    handshake: Arc<H>,
    metrics: Arc<Metrics>,
    addr: NetAddress,
) {
    manager.attempt(&addr);
    metrics.inc_crawl_attempts();

    let mut events = handshake.probe(addr);
    let mut succeeded = false;

    while let Some(event) = events.recv().await {
        match event {
            HandshakeEvent::Version {
                services,
                subnetwork_id,
            } => {
                debug!(
                    "peer {} version: services {} subnetwork {}",
                    addr, services, subnetwork_id
                );
                manager.good(&addr, services, subnetwork_id);
                succeeded = true;
            }
            HandshakeEvent::Addresses(list) => {
                let added = manager.add_addresses(&list);
                info!("peer {} sent {} addresses, {} new", addr, list.len(), added);
            }
            HandshakeEvent::Failed(reason) => {
                debug!("peer {}: {}", addr, reason);
            }
        }
    }

    if succeeded {
        metrics.inc_crawl_successes();
    } else {
        metrics.inc_crawl_failures();
    }
}
