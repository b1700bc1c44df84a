//! Sedra DNS Seeder
//!
//! Crawls the Sedra peer-to-peer network, keeps a table of known peer
//! addresses classified by health, and answers DNS queries for a
//! configured zone with samples of recently-verified peers so new nodes
//! can bootstrap with an ordinary A/AAAA lookup.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     SEDRA DNS SEEDER                       │
//! ├────────────────────────────────────────────────────────────┤
//! │  Crawler            ──► dials peers, version + getaddr     │
//! │  Address Manager    ──► shared table, state per address    │
//! │  Snapshot Loop      ──► peers.bin every 10 minutes         │
//! │  DNS Server (53)    ──► A/AAAA/NS/SOA from good addresses  │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

mod config;
mod crawler;
mod dns;
mod manager;
mod metrics;
mod netparams;
mod shutdown;
mod types;
mod wire;

use config::Config;
use crawler::handshake::TcpHandshake;
use crawler::{Crawler, SystemLookup};
use dns::DnsServer;
use manager::{snapshot, AddressManager};
use metrics::Metrics;
use netparams::{Network, NetworkParams};
use types::NetAddress;

/// Cadence of the status log line.
const STATUS_INTERVAL: Duration = Duration::from_secs(600);

/// Sedra DNS Seeder - peer discovery service for the Sedra network
#[derive(Parser, Debug)]
#[command(name = "sedra-dnsseeder")]
#[command(version)]
#[command(about = "Authoritative DNS seeder for the Sedra network", long_about = None)]
struct Args {
    /// DNS zone this seeder is authoritative for
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Value of the zone's NS record
    #[arg(short, long)]
    nameserver: Option<String>,

    /// Listen address for the DNS responder (port 53 needs privileges)
    #[arg(long)]
    listen: Option<String>,

    /// IP or hostname of a known node, injected into the table once
    #[arg(short, long)]
    seeder: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base directory for the address snapshot
    #[arg(long)]
    app_dir: Option<PathBuf>,

    /// Crawl the test network
    #[arg(long, group = "network")]
    testnet: bool,

    /// Crawl the development network
    #[arg(long, group = "network")]
    devnet: bool,

    /// Crawl the simulation network
    #[arg(long, group = "network")]
    simnet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn network(&self) -> Network {
        if self.testnet {
            Network::Testnet
        } else if self.devnet {
            Network::Devnet
        } else if self.simnet {
            Network::Simnet
        } else {
            Network::Mainnet
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Flag misuse is a config failure and exits 1; --help and --version
    // keep clap's conventional exit.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            e.exit()
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🌱 Sedra DNS Seeder v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, CLI flags win over the file.
    let network = args.network();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow::anyhow!("loading config {:?}: {}", path, e))?,
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(nameserver) = args.nameserver {
        config = config.with_nameserver(nameserver);
    }
    config = config
        .with_network(network)
        .with_listen(args.listen)
        .with_seeder(args.seeder)
        .with_app_dir(args.app_dir);
    config.validate()?;

    let params = NetworkParams::for_network(config.network);

    info!("⚙️  Configuration:");
    info!("   Network:    {}", config.network);
    info!("   Zone:       {}", config.zone());
    info!("   Nameserver: {}", config.nameserver_name());
    info!("   Listen:     {}", config.listen);
    info!("   App dir:    {:?}", config.net_app_dir());

    tokio::fs::create_dir_all(config.net_app_dir()).await?;

    let metrics = Arc::new(Metrics::new());
    let manager = Arc::new(AddressManager::new(config.snapshot_path(), metrics.clone()));
    info!("📦 address table holds {} peers", manager.address_count());

    if let Some(seeder) = config.seeder.clone() {
        inject_seed(&manager, &seeder, params.default_port).await;
    }

    let (shutdown_tx, shutdown) = shutdown::channel();
    let config = Arc::new(config);

    // The DNS listeners bind before anything is spawned; a bad address or
    // occupied port is a startup failure.
    let dns_server = DnsServer::bind(&config, manager.clone(), metrics.clone()).await?;

    let handshake = Arc::new(TcpHandshake::new(params, &config, shutdown.clone()));
    let crawler = Crawler::new(
        manager.clone(),
        handshake,
        params,
        metrics.clone(),
        config.max_probes,
        shutdown.clone(),
    );

    let crawl_handle = tokio::spawn(crawler.run(SystemLookup));
    let dns_handle = tokio::spawn(dns_server.serve(shutdown.clone()));
    let snapshot_handle = tokio::spawn(snapshot::run_snapshot_loop(
        manager.clone(),
        shutdown.clone(),
    ));
    let status_handle = tokio::spawn(run_status_loop(
        manager.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    info!("✅ all services started, press Ctrl+C to shut down");

    tokio::signal::ctrl_c().await?;
    info!("🛑 interrupt received, shutting down gracefully");

    shutdown_tx.send(true).ok();
    for (name, handle) in [
        ("crawler", crawl_handle),
        ("dns server", dns_handle),
        ("snapshot loop", snapshot_handle),
        ("status loop", status_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} did not shut down cleanly: {}", name, e);
        }
    }

    info!("👋 seeder shutdown complete");
    Ok(())
}

/// Inject the `--seeder` address. Hostnames go through the system
/// resolver; failures are logged and ignored, the crawl can still
/// bootstrap from the baked-in seeds.
async fn inject_seed(manager: &AddressManager, seeder: &str, default_port: u16) {
    let ip = match seeder.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => match tokio::net::lookup_host((seeder, 0)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                warn!("failed to resolve seed host {}: {}, ignoring", seeder, e);
                None
            }
        },
    };

    if let Some(ip) = ip {
        let addr = NetAddress::new(ip, default_port);
        let added = manager.add_addresses(&[addr]);
        info!("seed address {} injected ({} new)", addr, added);
    }
}

/// Periodic one-line summary of table health and counters.
async fn run_status_loop(manager: Arc<AddressManager>, metrics: Arc<Metrics>, mut shutdown: shutdown::Shutdown) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                info!(
                    "📊 status: up {}s, {} known, {} good, {} attempts, {} successes, {} dns queries, {} dropped at cap",
                    metrics.uptime_secs(),
                    manager.address_count(),
                    manager.good_count(),
                    metrics.get(&metrics.crawl_attempts),
                    metrics.get(&metrics.crawl_successes),
                    metrics.get(&metrics.dns_queries),
                    metrics.get(&metrics.store_full_drops),
                );
            }
            _ = shutdown.wait() => return,
        }
    }
}
