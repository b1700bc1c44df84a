//! Address table persistence
//!
//! The whole table is written as one file: a 4-byte magic, a version and
//! the bincode entry list. The write goes to a sibling temp file first
//! and is renamed into place, so a crash never leaves a torn snapshot.
//! Loading is best-effort; a file that fails any check is discarded.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{AddressEntry, AddressManager};
use crate::shutdown::Shutdown;

const SNAPSHOT_MAGIC: [u8; 4] = *b"SDRA";
const SNAPSHOT_VERSION: u32 = 1;

/// How often the background loop flushes the table to disk.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(600);

/// Serialize entries to `path` atomically.
pub fn save(path: &Path, entries: &[AddressEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut buf = Vec::with_capacity(8 + entries.len() * 64);
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    buf.extend_from_slice(&bincode::serialize(entries)?);

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("snapshot path {:?} has no file name", path))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Decode a snapshot file written by [`save`].
pub fn load(path: &Path) -> anyhow::Result<Vec<AddressEntry>> {
    let data = fs::read(path)?;
    if data.len() < 8 || data[..4] != SNAPSHOT_MAGIC {
        anyhow::bail!("not an address snapshot");
    }

    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != SNAPSHOT_VERSION {
        anyhow::bail!("unsupported snapshot version {version}");
    }

    let entries = bincode::deserialize(&data[8..])?;
    Ok(entries)
}

/// Background task: flush every [`SNAPSHOT_INTERVAL`] and once more at
/// shutdown. A failed write keeps the in-memory table and retries on the
/// next tick.
pub async fn run_snapshot_loop(manager: Arc<AddressManager>, mut shutdown: Shutdown) {
    let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
    // The first tick of a tokio interval fires immediately; the table was
    // just hydrated, skip it.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match manager.persist() {
                    Ok(()) => debug!("address snapshot written"),
                    Err(e) => warn!("address snapshot failed: {}", e),
                }
            }
            _ = shutdown.wait() => {
                match manager.persist() {
                    Ok(()) => info!("final address snapshot written"),
                    Err(e) => warn!("final address snapshot failed: {}", e),
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::types::{NetAddress, ServiceFlags, SubnetworkId};
    use std::net::{IpAddr, Ipv4Addr};

    fn entry(last: u8) -> AddressEntry {
        AddressEntry {
            addr: NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, last)), 16511),
            services: ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            subnetwork_id: Some(SubnetworkId([last; 20])),
            first_seen: 1_700_000_000,
            last_attempt: 1_700_000_100,
            last_success: 1_700_000_100,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");

        let entries = vec![entry(1), entry(2), entry(3)];
        save(&path, &entries).unwrap();

        let loaded = load(&path).unwrap();
        // Attribute-for-attribute equality.
        assert_eq!(loaded, entries);

        // No temp file left behind.
        assert!(!dir.path().join("peers.bin.tmp").exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");

        fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_load_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");

        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&99u32.to_be_bytes());
        fs::write(&path, &buf).unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_manager_hydrates_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");
        let metrics = Arc::new(Metrics::new());

        {
            let manager = AddressManager::new(path.clone(), metrics.clone());
            manager.good(
                &NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, 1)), 16511),
                ServiceFlags::NETWORK,
                SubnetworkId::SUPPORTS_ALL,
            );
            manager.persist().unwrap();
        }

        let manager = AddressManager::new(path, metrics);
        assert_eq!(manager.address_count(), 1);
        let entry = manager.snapshot_entries().pop().unwrap();
        assert_eq!(entry.services, ServiceFlags::NETWORK);
        assert_eq!(entry.subnetwork_id, Some(SubnetworkId::SUPPORTS_ALL));
    }

    #[tokio::test]
    async fn test_snapshot_loop_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");
        let manager = Arc::new(AddressManager::new(path.clone(), Arc::new(Metrics::new())));

        manager.add_addresses(&[
            NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, 1)), 16511),
            NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 0, 0, 2)), 16511),
        ]);

        let (tx, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn(run_snapshot_loop(manager, shutdown));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("snapshot loop must stop promptly")
            .unwrap();

        // Everything observed before shutdown is on disk.
        let entries = load(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.bin");
        fs::write(&path, b"garbage").unwrap();

        let manager = AddressManager::new(path, Arc::new(Metrics::new()));
        assert_eq!(manager.address_count(), 0);
    }
}
