//! Process configuration: role selection, network choice, and the
//! operator-provided slave list (SPEC_FULL.md §2.1/§6 "Persistence").
//!
//! Grounded on the host crate's `Args`/`NetConfig` split in `main.rs`:
//! a `clap`-derived CLI for what an operator types, deserialized once at
//! startup into the typed values the rest of the crate consumes.

use crate::net::types::NetAddress;
use crate::node::control::SlaveConfig;
use crate::services::ChainParams;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Plain relay/registry participant; no local identity.
    Utility,
    /// Owns exactly one collateralized identity.
    Service,
    /// Manages a local set of slave identities on behalf of an operator.
    Control,
}

#[derive(Debug, Parser)]
#[command(name = "utilitynode", version, about = "Utility-node overlay: gossip registry and control-node slave lifecycle")]
pub struct Args {
    /// Which role this process plays in the overlay.
    #[arg(long, value_enum, default_value = "utility")]
    pub role: Role,

    /// Use testnet chain parameters instead of mainnet.
    #[arg(long)]
    pub testnet: bool,

    /// Address this node listens for peers on.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_address: IpAddr,

    /// Port this node listens for peers on; defaults to the network's
    /// fixed service port when unset.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Data directory (address manager persistence, logs).
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Shared-secret WIF for a service node's identity (role = service).
    #[arg(long)]
    pub shared_key: Option<String>,

    /// Path to the control node's slave configuration file (role = control).
    #[arg(long)]
    pub slaves_file: Option<PathBuf>,
}

impl Args {
    pub fn chain_params(&self) -> ChainParams {
        if self.testnet {
            ChainParams::testnet()
        } else {
            ChainParams::mainnet()
        }
    }

    pub fn listen_address(&self) -> NetAddress {
        let port = self.listen_port.unwrap_or_else(|| self.chain_params().service_port);
        NetAddress::new(self.listen_address, port)
    }
}

/// One entry in the slave configuration file: the operator-facing JSON shape
/// for `SlaveConfig` (shared key supplied as WIF rather than a raw scalar).
#[derive(Debug, Deserialize)]
struct SlaveConfigFile {
    alias: String,
    wallet_address: String,
    inet_address: String,
    shared_key_wif: String,
}

/// Loads and parses the control node's slave list (SPEC_FULL.md §6:
/// "slave configurations are loaded at start from an operator-provided
/// file"). JSON, deserialized with `serde` like every other on-disk
/// artifact this crate's ambient stack touches.
pub fn load_slaves(path: &Path) -> Result<Vec<SlaveConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let entries: Vec<SlaveConfigFile> =
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    entries
        .into_iter()
        .map(|e| {
            let inet_address: std::net::SocketAddr = e
                .inet_address
                .parse()
                .map_err(|_| ConfigError::InvalidInetAddress(e.inet_address.clone()))?;
            let keypair = crate::crypto::Keypair::from_wif(&e.shared_key_wif)
                .map_err(|err| ConfigError::InvalidSharedKey(e.alias.clone(), err.to_string()))?;
            Ok(SlaveConfig {
                alias: e.alias,
                wallet_address: e.wallet_address,
                inet_address: NetAddress::from(inet_address),
                shared_private_key: keypair.secret_key(),
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read slave config {0:?}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse slave config {0:?}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("invalid inet address in slave config: {0}")]
    InvalidInetAddress(String),

    #[error("invalid shared key for slave '{0}': {1}")]
    InvalidSharedKey(String, String),
}
