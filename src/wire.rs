//! Peer wire messages
//!
//! The seeder only speaks the handful of messages the crawl needs: the
//! version exchange and the address solicitation. Frames are the network
//! magic, a big-endian length and a bincode body.
//!
//! ```text
//! +-------+----------+------------------+
//! | magic | len (BE) | bincode(Message) |
//! +-------+----------+------------------+
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{NetAddress, ServiceFlags, SubnetworkId};

/// Maximum frame body size (1 MiB). Anything larger is a protocol error.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Version handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub subnetwork_id: SubnetworkId,
    pub user_agent: String,
    /// Sender's unix time, seconds.
    pub timestamp: u64,
}

/// Every message the seeder can send or receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    GetAddresses,
    Addresses(Vec<NetAddress>),
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, magic: u32, message: &Message) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("outgoing message too large: {} bytes", body.len());
    }

    writer.write_all(&magic.to_be_bytes()).await?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message, verifying the network magic.
pub async fn read_message<R>(reader: &mut R, magic: u32) -> anyhow::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;

    let got_magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if got_magic != magic {
        anyhow::bail!("wrong network magic {got_magic:#010x}");
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("incoming message too large: {len} bytes");
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let message = bincode::deserialize(&body)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const TEST_MAGIC: u32 = 0x53647473;

    fn test_version() -> Message {
        Message::Version(VersionMessage {
            protocol_version: 1,
            services: ServiceFlags::NETWORK,
            subnetwork_id: SubnetworkId::SUPPORTS_ALL,
            user_agent: "/sedra-dnsseeder:0.1.0/".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let messages = vec![
            test_version(),
            Message::Verack,
            Message::GetAddresses,
            Message::Addresses(vec![
                NetAddress::new(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)), 16511),
                NetAddress::new("2001:db8::1".parse().unwrap(), 16511),
            ]),
        ];

        let mut buf = Vec::new();
        for message in &messages {
            write_message(&mut buf, TEST_MAGIC, message).await.unwrap();
        }

        let mut cursor = std::io::Cursor::new(buf);
        for expected in &messages {
            let got = read_message(&mut cursor, TEST_MAGIC).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn test_wrong_magic_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, TEST_MAGIC, &Message::Verack).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor, TEST_MAGIC + 1).await.unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&TEST_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor, TEST_MAGIC).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
