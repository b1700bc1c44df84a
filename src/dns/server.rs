//! DNS listeners
//!
//! One UDP socket and one TCP listener on the same address. Every packet
//! or connection is handled on its own task; the listeners themselves
//! stop when shutdown is signalled, which also unblocks pending reads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::manager::AddressManager;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;

use super::handler::DnsHandler;
use super::message::TCP_MAX_PAYLOAD;

/// Largest query we accept over UDP.
const UDP_RECV_SIZE: usize = 4096;

/// Budget per TCP query on one connection.
const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The bound listeners, ready to serve.
///
/// Binding is split from serving so a bad listen address or an occupied
/// port is a startup failure, not a background task death.
pub struct DnsServer {
    udp: UdpSocket,
    tcp: TcpListener,
    handler: Arc<DnsHandler>,
}

impl DnsServer {
    pub async fn bind(
        config: &Config,
        manager: Arc<AddressManager>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let listen: SocketAddr = config
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", config.listen))?;

        let udp = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("binding UDP {listen}"))?;
        let tcp = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding TCP {listen}"))?;

        info!("DNS server listening on {} (udp/tcp)", listen);

        Ok(Self {
            udp,
            tcp,
            handler: Arc::new(DnsHandler::new(manager, metrics, config)),
        })
    }

    /// Serve until shutdown is signalled.
    pub async fn serve(self, shutdown: Shutdown) {
        tokio::join!(
            run_udp(self.udp, self.handler.clone(), shutdown.clone()),
            run_tcp(self.tcp, self.handler, shutdown),
        );
        info!("DNS server shut down");
    }
}

async fn run_udp(socket: UdpSocket, handler: Arc<DnsHandler>, mut shutdown: Shutdown) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; UDP_RECV_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let packet = buf[..len].to_vec();
                        let socket = socket.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_udp_query(&socket, &handler, packet, src).await;
                        });
                    }
                    Err(e) => {
                        error!("UDP socket error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_udp_query(
    socket: &UdpSocket,
    handler: &DnsHandler,
    packet: Vec<u8>,
    src: SocketAddr,
) {
    let Some(response) = handler.handle(&packet) else {
        return;
    };
    // Truncated answers carry the TC bit, inviting a TCP retry.
    let encoded = response.encode(response.udp_payload);
    if let Err(e) = socket.send_to(&encoded, src).await {
        debug!("UDP send to {} failed: {}", src, e);
    }
}

async fn run_tcp(listener: TcpListener, handler: Arc<DnsHandler>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            result = listener.accept() => {
                match result {
                    Ok((stream, src)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_tcp_connection(stream, &handler).await {
                                debug!("TCP query from {} failed: {}", src, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Serve length-prefixed queries on one connection until the client
/// closes it or goes quiet.
async fn handle_tcp_connection(mut stream: TcpStream, handler: &DnsHandler) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_QUERY_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            // EOF or idle: done with this client.
            Ok(Err(_)) | Err(_) => return Ok(()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        let mut packet = vec![0u8; len];
        tokio::time::timeout(TCP_QUERY_TIMEOUT, stream.read_exact(&mut packet))
            .await
            .map_err(|_| anyhow::anyhow!("query body timeout"))??;

        let Some(response) = handler.handle(&packet) else {
            continue;
        };
        let encoded = response.encode(TCP_MAX_PAYLOAD);

        stream.write_all(&(encoded.len() as u16).to_be_bytes()).await?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::{tests::build_query, TYPE_A};
    use crate::shutdown;
    use crate::types::{NetAddress, ServiceFlags, SubnetworkId};
    use std::net::{IpAddr, Ipv4Addr};

    const ZONE: &str = "seed.sedranet.org";

    fn test_setup() -> (Arc<Config>, Arc<AddressManager>, Arc<Metrics>) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(AddressManager::new(
            dir.path().join("peers.bin"),
            metrics.clone(),
        ));
        let config = Arc::new(
            Config::default()
                .with_host(ZONE.to_string())
                .with_nameserver("ns1.sedranet.org".to_string())
                .with_listen(Some("127.0.0.1:0".to_string())),
        );
        (config, manager, metrics)
    }

    #[tokio::test]
    async fn test_udp_query_end_to_end() {
        let (config, manager, metrics) = test_setup();
        for i in 1..=5u8 {
            manager.good(
                &NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, i)), 16511),
                ServiceFlags::NETWORK,
                SubnetworkId::SUPPORTS_ALL,
            );
        }

        // Bind on an ephemeral port directly so the test can learn it.
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = udp.local_addr().unwrap();
        let handler = Arc::new(DnsHandler::new(manager, metrics, &config));
        let (tx, shutdown) = shutdown::channel();
        let server = tokio::spawn(run_udp(udp, handler, shutdown));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x77, ZONE, TYPE_A, None);
        client.send_to(&query, server_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = &buf[..len];

        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), 0x77);
        // QR + AA set, rcode NOERROR.
        assert_eq!(packet[2] & 0x80, 0x80);
        assert_eq!(packet[3] & 0x0f, 0);
        let ancount = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!(ancount, 5);

        tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_query_end_to_end() {
        let (config, manager, metrics) = test_setup();
        manager.good(
            &NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, 1)), 16511),
            ServiceFlags::NETWORK,
            SubnetworkId::SUPPORTS_ALL,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let handler = Arc::new(DnsHandler::new(manager, metrics, &config));
        let (tx, shutdown) = shutdown::channel();
        let server = tokio::spawn(run_tcp(listener, handler, shutdown));

        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        let query = build_query(0x99, ZONE, TYPE_A, None);
        stream
            .write_all(&(query.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&query).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut packet = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut packet).await.unwrap();

        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), 0x99);
        let ancount = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!(ancount, 1);

        tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let (config, manager, metrics) = test_setup();
        let (tx, shutdown) = shutdown::channel();

        let server = DnsServer::bind(&config, manager, metrics).await.unwrap();
        let handle = tokio::spawn(server.serve(shutdown));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server must stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_an_error() {
        let (config, manager, metrics) = test_setup();
        let config = Config {
            listen: "not-an-address".to_string(),
            ..(*config).clone()
        };
        assert!(DnsServer::bind(&config, manager, metrics).await.is_err());
    }
}
