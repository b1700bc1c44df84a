//! Network parameter bundles
//!
//! Magic bytes, default peer port and bootstrap seed hostnames for each
//! Sedra network. Exactly one bundle is active per process.

use std::fmt;

/// Which Sedra network the seeder crawls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Simnet,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Devnet => "devnet",
            Network::Simnet => "simnet",
        };
        write!(f, "{name}")
    }
}

/// Parameters of one network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkParams {
    pub network: Network,
    /// Wire frame magic. Mismatched magic means a peer on another network.
    pub magic: u32,
    pub default_port: u16,
    /// Hostnames resolved when the address table is empty.
    pub dns_seeds: &'static [&'static str],
}

pub const MAINNET_PARAMS: NetworkParams = NetworkParams {
    network: Network::Mainnet,
    magic: 0x5364_6d6e,
    default_port: 16511,
    dns_seeds: &[
        "dnsseed1.sedranet.org",
        "dnsseed2.sedranet.org",
        "dnsseed.sedra-labs.io",
    ],
};

pub const TESTNET_PARAMS: NetworkParams = NetworkParams {
    network: Network::Testnet,
    magic: 0x5364_746e,
    default_port: 16611,
    dns_seeds: &["testnet-dnsseed1.sedranet.org", "testnet-dnsseed2.sedranet.org"],
};

pub const DEVNET_PARAMS: NetworkParams = NetworkParams {
    network: Network::Devnet,
    magic: 0x5364_6476,
    default_port: 16711,
    dns_seeds: &["devnet-dnsseed.sedranet.org"],
};

pub const SIMNET_PARAMS: NetworkParams = NetworkParams {
    network: Network::Simnet,
    magic: 0x5364_736d,
    default_port: 16811,
    dns_seeds: &[],
};

impl NetworkParams {
    pub fn for_network(network: Network) -> &'static NetworkParams {
        match network {
            Network::Mainnet => &MAINNET_PARAMS,
            Network::Testnet => &TESTNET_PARAMS,
            Network::Devnet => &DEVNET_PARAMS,
            Network::Simnet => &SIMNET_PARAMS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_magics_and_ports() {
        let all = [MAINNET_PARAMS, TESTNET_PARAMS, DEVNET_PARAMS, SIMNET_PARAMS];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.magic, b.magic);
                assert_ne!(a.default_port, b.default_port);
            }
        }
    }

    #[test]
    fn test_lookup_by_network() {
        assert_eq!(NetworkParams::for_network(Network::Testnet).default_port, 16611);
        assert_eq!(NetworkParams::for_network(Network::Mainnet).network, Network::Mainnet);
    }
}
