//! Seeder configuration
//!
//! Values come from an optional TOML file overridden by CLI flags.
//! Defaults are chosen so a bare `--host`/`--nameserver` invocation is a
//! working seeder on the unprivileged DNS port.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::netparams::Network;
use crate::types::{ServiceFlags, SubnetworkId};

/// Name of the address snapshot inside the per-network app directory.
pub const SNAPSHOT_FILE: &str = "peers.bin";

/// Main configuration for the seeder process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // === DNS zone ===
    /// Zone this seeder is authoritative for, e.g. `seed.sedranet.org`.
    pub host: String,

    /// Value of the zone's NS record.
    pub nameserver: String,

    /// UDP/TCP listen address for the DNS responder.
    pub listen: String,

    /// Mailbox label used to synthesize the SOA RNAME.
    pub soa_admin: String,

    // === Crawling ===
    /// One-shot address (IP or hostname) injected into the table at startup.
    pub seeder: Option<String>,

    /// Service bits a peer must advertise to be handed out by default.
    pub default_services: ServiceFlags,

    /// Only hand out peers of this subnetwork (peers advertising
    /// supports-all always qualify). No filter by default.
    pub subnetwork_filter: Option<SubnetworkId>,

    /// Upper bound on concurrent handshake workers.
    pub max_probes: usize,

    /// Protocol version advertised in our version message.
    pub protocol_version: u32,

    /// User agent advertised in our version message.
    pub user_agent: String,

    // === Filesystem ===
    /// Base application directory; network name is appended.
    pub app_dir: PathBuf,

    /// Selected network. CLI-only, never read from the config file.
    #[serde(skip)]
    pub network: Network,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            nameserver: String::new(),
            listen: "0.0.0.0:5354".to_string(),
            soa_admin: "hostmaster".to_string(),
            seeder: None,
            default_services: ServiceFlags::NETWORK,
            subnetwork_filter: None,
            max_probes: 512,
            protocol_version: 1,
            user_agent: format!("/sedra-dnsseeder:{}/", env!("CARGO_PKG_VERSION")),
            app_dir: PathBuf::from("./data"),
            network: Network::Mainnet,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    pub fn with_nameserver(mut self, nameserver: String) -> Self {
        self.nameserver = nameserver;
        self
    }

    pub fn with_listen(mut self, listen: Option<String>) -> Self {
        if let Some(listen) = listen {
            self.listen = listen;
        }
        self
    }

    pub fn with_seeder(mut self, seeder: Option<String>) -> Self {
        if seeder.is_some() {
            self.seeder = seeder;
        }
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_app_dir(mut self, app_dir: Option<PathBuf>) -> Self {
        if let Some(app_dir) = app_dir {
            self.app_dir = app_dir;
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("no hostname specified, use --host");
        }
        if self.nameserver.is_empty() {
            anyhow::bail!("no nameserver specified, use --nameserver");
        }
        if self.listen.parse::<SocketAddr>().is_err() {
            anyhow::bail!("invalid listen address {:?}", self.listen);
        }
        if self.max_probes == 0 {
            anyhow::bail!("max_probes must be at least 1");
        }
        Ok(())
    }

    /// The served zone, normalized: lowercase, no trailing dot.
    pub fn zone(&self) -> String {
        self.host.trim_end_matches('.').to_lowercase()
    }

    /// The NS record value, normalized like [`Config::zone`].
    pub fn nameserver_name(&self) -> String {
        self.nameserver.trim_end_matches('.').to_lowercase()
    }

    /// SOA RNAME: the admin mailbox inside the served zone.
    pub fn soa_rname(&self) -> String {
        format!("{}.{}", self.soa_admin, self.zone())
    }

    /// Per-network application directory.
    pub fn net_app_dir(&self) -> PathBuf {
        self.app_dir.join(self.network.to_string())
    }

    /// Path of the address snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.net_app_dir().join(SNAPSHOT_FILE)
    }
}
