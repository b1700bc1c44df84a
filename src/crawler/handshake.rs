//! Handshake client
//!
//! Dials one peer, runs the version exchange, solicits addresses and
//! reports what happened as a stream of typed events. The client never
//! touches the address table; it only returns facts.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::Config;
use crate::netparams::NetworkParams;
use crate::shutdown::Shutdown;
use crate::types::{NetAddress, ServiceFlags, SubnetworkId};
use crate::wire::{read_message, write_message, Message, VersionMessage};

/// Budget for each stage: dial, version wait, addr wait.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome events of one probe, in the order they happened.
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// The remote's version message was parsed.
    Version {
        services: ServiceFlags,
        subnetwork_id: SubnetworkId,
    },
    /// One address batch arrived in response to our solicitation.
    Addresses(Vec<NetAddress>),
    /// Dial failure, timeout, malformed message or early disconnect.
    Failed(String),
}

/// The probe capability the crawl engine depends on.
///
/// The receiver yields events until the probe finishes; the channel
/// closing is the end-of-probe signal.
pub trait Handshake: Send + Sync + 'static {
    fn probe(&self, target: NetAddress) -> mpsc::Receiver<HandshakeEvent>;
}

/// Production implementation speaking the Sedra wire protocol over TCP.
pub struct TcpHandshake {
    magic: u32,
    protocol_version: u32,
    user_agent: String,
    shutdown: Shutdown,
}

impl TcpHandshake {
    pub fn new(params: &NetworkParams, config: &Config, shutdown: Shutdown) -> Self {
        Self {
            magic: params.magic,
            protocol_version: config.protocol_version,
            user_agent: config.user_agent.clone(),
            shutdown,
        }
    }

    fn our_version(&self) -> VersionMessage {
        VersionMessage {
            protocol_version: self.protocol_version,
            services: ServiceFlags::NONE,
            subnetwork_id: SubnetworkId::SUPPORTS_ALL,
            user_agent: self.user_agent.clone(),
            timestamp: crate::manager::unix_now(),
        }
    }
}

impl Handshake for TcpHandshake {
    fn probe(&self, target: NetAddress) -> mpsc::Receiver<HandshakeEvent> {
        let (tx, rx) = mpsc::channel(4);
        let magic = self.magic;
        let our_version = self.our_version();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = exchange(magic, our_version, target, &tx) => {
                    if let Err(e) = result {
                        let _ = tx.send(HandshakeEvent::Failed(e.to_string())).await;
                    }
                }
                _ = shutdown.wait() => {
                    let _ = tx
                        .send(HandshakeEvent::Failed("shutting down".to_string()))
                        .await;
                }
            }
        });

        rx
    }
}

/// Drive the full exchange; the stream drop at the end is the disconnect.
async fn exchange(
    magic: u32,
    our_version: VersionMessage,
    target: NetAddress,
    tx: &mpsc::Sender<HandshakeEvent>,
) -> anyhow::Result<()> {
    let mut stream = timeout(STAGE_TIMEOUT, TcpStream::connect(target.socket_addr()))
        .await
        .map_err(|_| anyhow::anyhow!("dial timeout"))??;

    write_message(&mut stream, magic, &Message::Version(our_version)).await?;

    let remote = timeout(STAGE_TIMEOUT, read_message(&mut stream, magic))
        .await
        .map_err(|_| anyhow::anyhow!("version timeout"))??;
    let (services, subnetwork_id) = match remote {
        Message::Version(v) => (v.services, v.subnetwork_id),
        _ => anyhow::bail!("peer spoke before version"),
    };
    let _ = tx
        .send(HandshakeEvent::Version {
            services,
            subnetwork_id,
        })
        .await;

    write_message(&mut stream, magic, &Message::Verack).await?;
    write_message(&mut stream, magic, &Message::GetAddresses).await?;

    // The peer's verack may arrive before its address batch; skip past it
    // within the same stage budget.
    let started = tokio::time::Instant::now();
    loop {
        let remaining = STAGE_TIMEOUT
            .checked_sub(started.elapsed())
            .ok_or_else(|| anyhow::anyhow!("getaddr timeout"))?;
        let message = timeout(remaining, read_message(&mut stream, magic))
            .await
            .map_err(|_| anyhow::anyhow!("getaddr timeout"))??;

        match message {
            Message::Addresses(list) => {
                let _ = tx.send(HandshakeEvent::Addresses(list)).await;
                return Ok(());
            }
            Message::Verack => continue,
            Message::Version(_) => anyhow::bail!("duplicate version"),
            Message::GetAddresses => continue,
        }
    }
}
