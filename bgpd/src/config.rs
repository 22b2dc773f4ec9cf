//! TOML configuration file format and CLI arguments.
//!
//! Shape mirrors the two record types the spec describes: one `[local]`
//! table for this speaker's own identity, and zero or more `[[peer]]`
//! tables, one per configured neighbor.

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "bgpd", about = "A minimal BGP-4 speaker")]
pub struct Args {
    /// Path to the TOML configuration file.
    pub config: PathBuf,

    /// TCP port to accept inbound BGP sessions on.
    #[arg(short = 'p', long, default_value_t = 1179)]
    pub listen_port: u16,

    /// Address to bind the listening socket to.
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    pub listen_addr: std::net::Ipv4Addr,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Whether this speaker dials out to the peer or waits for it to connect.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Establishment {
    #[default]
    Active,
    Passive,
}

/// This speaker's own identity and locally-originated networks.
#[derive(Clone, Debug, Deserialize)]
pub struct LocalConfig {
    pub asn: u16,
    /// Also used as the 4-octet BGP identifier sent in the OPEN message.
    pub address: Ipv4Addr,
    /// CIDR-notation networks to originate into every established session,
    /// e.g. `"198.51.100.0/24"`.
    #[serde(default)]
    pub networks: Vec<String>,
}

/// One configured neighbor.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerConfig {
    pub asn: u16,
    pub address: Ipv4Addr,
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    /// Defaults to `hold_time / 3` if omitted (spec Section 4.4).
    pub keepalive_time: Option<u16>,
    #[serde(default = "default_conn_retry_time")]
    pub conn_retry_time: u64,
    /// How long Idle waits before automatically issuing `Start` again after
    /// a Cease or administrative stop (spec Section 4.4).
    #[serde(default = "default_idle_time")]
    pub idle_time: u64,
    #[serde(default)]
    pub establishment: Establishment,
}

const fn default_hold_time() -> u16 {
    90
}

const fn default_conn_retry_time() -> u64 {
    30
}

const fn default_idle_time() -> u64 {
    30
}

/// The full configuration file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub local: LocalConfig,
    #[serde(rename = "peer", default)]
    pub peers: Vec<PeerConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for network in &self.local.networks {
            parse_cidr(network)
                .with_context(|| format!("local network {network:?} is not a valid CIDR prefix"))?;
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            anyhow::ensure!(
                seen.insert(peer.address),
                "duplicate peer address {}",
                peer.address
            );
            anyhow::ensure!(
                peer.hold_time == 0 || peer.hold_time >= 3,
                "peer {} hold_time must be 0 or >= 3",
                peer.address
            );
        }
        Ok(())
    }
}

/// Parse a `"a.b.c.d/len"` string into a [`bgpd_proto::prefix::Prefix`].
pub fn parse_cidr(s: &str) -> anyhow::Result<bgpd_proto::prefix::Prefix> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("missing '/' in CIDR prefix"))?;
    let addr: Ipv4Addr = addr.parse().context("invalid IPv4 address")?;
    let len: u8 = len.parse().context("invalid prefix length")?;
    anyhow::ensure!(len <= 32, "prefix length {len} out of range");
    Ok(bgpd_proto::prefix::Prefix::new(len, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            [local]
            asn = 65000
            address = "192.0.2.1"
            networks = ["198.51.100.0/24"]

            [[peer]]
            asn = 65001
            address = "192.0.2.2"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.local.asn, 65000);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].hold_time, 90);
        assert_eq!(config.peers[0].establishment, Establishment::Active);
    }

    #[test]
    fn rejects_duplicate_peer_address() {
        let toml = r#"
            [local]
            asn = 65000
            address = "192.0.2.1"

            [[peer]]
            asn = 65001
            address = "192.0.2.2"

            [[peer]]
            asn = 65002
            address = "192.0.2.2"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_cidr_masks_host_bits() {
        let prefix = parse_cidr("10.0.1.5/24").unwrap();
        assert_eq!(prefix.addr, "10.0.1.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(prefix.prefix_len, 24);
    }
}
