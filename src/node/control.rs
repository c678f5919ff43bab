//! `ControlNode`: manages N local `SlaveNodeInfo` identities whose collateral
//! lives in the operator's wallet. On operator command it assembles a signed
//! `snstrt`/`snstop` for a slave and injects it into the overlay; on every
//! maintenance tick it locks each slave's collateral outpoint in the wallet
//! and reverts any slave stuck in a `Processing*` state past the timeout
//! (SPEC_FULL.md §4.3).

use super::{RoleHooks, UtilityNode};
use crate::crypto::Keypair;
use crate::error::{OperatorError, OperatorResult};
use crate::net::message::{Message, SnStart, SnStop};
use crate::net::types::NetAddress;
use crate::registry::{Entry, SlaveNodeInfo, ServiceNodeInfo, State};
use crate::services::{OverlayParams, Services};
use crate::types::{PublicKey, TxIn};
use async_trait::async_trait;
use tracing::{info, warn};

/// One slave identity as loaded from the operator's configuration file:
/// everything `StartSlaveNode` needs before it can `UpdateTxIn`/
/// `UpdateWalletPublicKey` against the live wallet and chain.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub alias: String,
    pub wallet_address: String,
    pub inet_address: NetAddress,
    pub shared_private_key: bitcoin::secp256k1::SecretKey,
}

pub struct ControlNode {
    pub base: UtilityNode,
}

impl ControlNode {
    pub fn new(services: Services) -> Self {
        Self {
            base: UtilityNode::new(services),
        }
    }

    /// Loads the operator's slave list into the registry as `Entry::Slave`
    /// rows, each keyed provisionally by a zero `TxIn` until `StartSlaveNode`
    /// discovers its real collateral (`UpdateTxIn`). Aliases must be unique;
    /// a duplicate is a configuration error caught here rather than silently
    /// shadowing an existing slave.
    pub async fn load_slaves(&self, configs: Vec<SlaveConfig>) -> OperatorResult<()> {
        let mut registry = self.base.registry.lock().await;
        for (i, cfg) in configs.into_iter().enumerate() {
            if registry.find_slave_by_alias(&cfg.alias).is_some() {
                return Err(OperatorError::InvalidAddress(format!(
                    "duplicate slave alias '{}'",
                    cfg.alias
                )));
            }
            let shared_key = Keypair::from_private_key(cfg.shared_private_key);
            let placeholder_tx_in = TxIn::new(crate::types::Hash::zero(), i as u32);
            let info = ServiceNodeInfo {
                tx_in: placeholder_tx_in,
                inet_address: cfg.inet_address,
                wallet_public_key: shared_key.public_key(),
                shared_public_key: shared_key.public_key(),
                signature: crate::types::Signature([0u8; 65]),
                signature_time: 0,
                last_ping: 0,
                last_start: 0,
                last_stop: 0,
                last_seen: 0,
                time_stopped: 0,
                service_node_count: -1,
                service_node_index: -1,
                state: State::Stopped,
            };
            registry.insert(Entry::Slave(SlaveNodeInfo {
                info,
                alias: cfg.alias,
                wallet_address: cfg.wallet_address,
                shared_private_key: cfg.shared_private_key,
                processing_start_time: 0,
            }));
        }
        Ok(())
    }

    /// `GenerateSharedKey()`: mint a fresh compressed secp256k1 private key
    /// and return its WIF encoding for the operator to install on the
    /// remote service node.
    pub fn generate_shared_key(&self) -> String {
        let kp = Keypair::generate();
        kp.to_wif(self.base.services.params.chain.network)
    }

    async fn require_not_syncing(&self) -> OperatorResult<()> {
        if self.base.services.chain.is_initial_block_download().await {
            return Err(OperatorError::ChainSyncing);
        }
        Ok(())
    }

    async fn require_wallet_unlocked(&self) -> OperatorResult<()> {
        if self.base.services.wallet.is_locked().await {
            return Err(OperatorError::WalletLocked);
        }
        Ok(())
    }

    /// `StartSlaveNode(alias)` (SPEC_FULL.md §4.3).
    pub async fn start_slave_node(&self, alias: &str) -> OperatorResult<()> {
        self.require_not_syncing().await?;
        self.require_wallet_unlocked().await?;

        let params = self.base.services.params;
        let now = self.base.services.now();

        let idx = {
            let registry = self.base.registry.lock().await;
            registry
                .find_slave_by_alias(alias)
                .ok_or_else(|| OperatorError::UnknownAlias(alias.to_string()))?
        };

        {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            if slave.info.is_processing() {
                return Err(OperatorError::StillProcessing(alias.to_string()));
            }
            if slave.info.state == State::Started {
                return Err(OperatorError::AlreadyStarted(alias.to_string()));
            }
        }

        let inet_address = {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            slave.info.inet_address
        };
        if inet_address.port != params.chain.service_port {
            return Err(OperatorError::InvalidAddress(alias.to_string()));
        }

        let (tx_in, collateral_confirmations) =
            self.update_tx_in(alias, idx, &params).await?;
        let wallet_public_key = self.update_wallet_public_key(alias, idx).await?;
        let _ = collateral_confirmations;

        self.base
            .services
            .transport
            .connect(inet_address)
            .await
            .ok_or_else(|| OperatorError::ConnectFailed {
                alias: alias.to_string(),
                addr: inet_address.to_string(),
            })?;

        let shared_key = {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            Keypair::from_private_key(slave.shared_private_key)
        };
        let signing_string =
            SnStart::signing_string(now, &inet_address, &wallet_public_key, &shared_key.public_key());

        // The `snstrt` is signed with the slave's *wallet* key, which this
        // crate never holds directly — the wallet collaborator signs on our
        // behalf by address, exactly as `CWallet::SignMessage` does.
        let wallet_signature = self
            .sign_start(&signing_string, &wallet_public_key)
            .await
            .ok_or_else(|| OperatorError::SignFailed(alias.to_string()))?;

        let start = SnStart {
            time: now,
            tx_in,
            inet_address,
            wallet_public_key,
            shared_public_key: shared_key.public_key(),
            count: -1,
            index: -1,
            signature: wallet_signature,
        };

        {
            let mut registry = self.base.registry.lock().await;
            let entry = registry.get_mut(idx).unwrap();
            if let Entry::Slave(slave) = entry {
                slave.info.tx_in = tx_in;
                slave.info.wallet_public_key = wallet_public_key;
                slave.info.signature = start.signature;
                slave.info.signature_time = now;
                slave.info.last_seen = now;
                slave.info.last_start = now;
                slave.info.service_node_count = -1;
                slave.info.service_node_index = -1;
                slave.info.state = State::ProcessingStart;
                slave.processing_start_time = now;
            }
            registry.touch(idx);
        }

        info!(alias, tx_in = %tx_in, "slave node start issued");
        self.base.relay(Message::Start(start)).await;
        Ok(())
    }

    /// `StopSlaveNode(alias)` (SPEC_FULL.md §4.3): symmetric with start,
    /// requires the slave be `Started`.
    pub async fn stop_slave_node(&self, alias: &str) -> OperatorResult<()> {
        self.require_not_syncing().await?;
        self.require_wallet_unlocked().await?;

        let now = self.base.services.now();
        let idx = {
            let registry = self.base.registry.lock().await;
            registry
                .find_slave_by_alias(alias)
                .ok_or_else(|| OperatorError::UnknownAlias(alias.to_string()))?
        };

        let (tx_in, inet_address, shared_public_key, wallet_public_key) = {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            if slave.info.state != State::Started {
                return Err(OperatorError::NotStarted(alias.to_string()));
            }
            (
                slave.info.tx_in,
                slave.info.inet_address,
                slave.info.shared_public_key,
                slave.info.wallet_public_key,
            )
        };

        let signing_string = SnStop::signing_string(now, &tx_in, &inet_address, &shared_public_key);
        let signature = self
            .sign_start(&signing_string, &wallet_public_key)
            .await
            .ok_or_else(|| OperatorError::SignFailed(alias.to_string()))?;

        let stop = SnStop {
            time: now,
            tx_in,
            inet_address,
            shared_public_key,
            signature,
        };

        {
            let mut registry = self.base.registry.lock().await;
            if let Entry::Slave(slave) = registry.get_mut(idx).unwrap() {
                slave.info.state = State::ProcessingStop;
                slave.processing_start_time = now;
            }
        }

        info!(alias, tx_in = %tx_in, "slave node stop issued");
        self.base.relay(Message::Stop(stop)).await;
        Ok(())
    }

    /// `UpdateTxIn()`: scan the wallet's available coins for one paying
    /// exactly the required collateral amount to the slave's wallet address
    /// with at least the minimum confirmations. First match wins.
    async fn update_tx_in(
        &self,
        alias: &str,
        idx: crate::registry::Index,
        params: &OverlayParams,
    ) -> OperatorResult<(TxIn, u32)> {
        let address_hash = {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            parse_address_hash160(&slave.wallet_address)
                .ok_or_else(|| OperatorError::InvalidAddress(alias.to_string()))?
        };

        let coins = self.base.services.wallet.available_coins().await;
        let matching = coins.into_iter().find(|c| {
            c.amount_sats == params.chain.collateral_amount_sats
                && c.address_pubkey_hash == address_hash
        });

        match matching {
            Some(coin) if coin.confirmations >= params.chain.min_confirmations => {
                Ok((coin.tx_in, coin.confirmations))
            }
            Some(coin) => Err(OperatorError::InsufficientConfirmations {
                alias: alias.to_string(),
                actual: coin.confirmations,
                required: params.chain.min_confirmations,
            }),
            None => Err(OperatorError::NoCollateralFound {
                alias: alias.to_string(),
                required: params.chain.collateral_amount_sats,
                min_confirmations: params.chain.min_confirmations,
            }),
        }
    }

    /// `UpdateWalletPublicKey()`: fetch the public key controlling the
    /// slave's wallet address from the wallet collaborator.
    async fn update_wallet_public_key(
        &self,
        alias: &str,
        idx: crate::registry::Index,
    ) -> OperatorResult<PublicKey> {
        let address_hash = {
            let registry = self.base.registry.lock().await;
            let slave = registry.get(idx).unwrap().as_slave().unwrap();
            parse_address_hash160(&slave.wallet_address)
                .ok_or_else(|| OperatorError::InvalidAddress(alias.to_string()))?
        };
        self.base
            .services
            .wallet
            .get_public_key(&address_hash)
            .await
            .ok_or_else(|| OperatorError::InvalidKey(alias.to_string()))
    }

    /// Signs `signing_string` as the slave's wallet key. The wallet
    /// collaborator holds the private key (this crate never does); it is
    /// asked to sign by address rather than handing back raw key material.
    async fn sign_start(
        &self,
        signing_string: &str,
        wallet_public_key: &PublicKey,
    ) -> Option<crate::types::Signature> {
        self.base
            .services
            .wallet
            .sign_with_address(&wallet_public_key.hash160(), signing_string)
            .await
    }

    /// Locks each slave's collateral outpoint in the wallet so an operator
    /// spend can't accidentally invalidate a running service node
    /// (`UpdateLocks`, overriding the base no-op).
    async fn update_locks(&self) {
        let slaves: Vec<TxIn> = {
            let registry = self.base.registry.lock().await;
            registry
                .iter()
                .filter_map(|(_, e)| e.as_slave())
                .map(|s| s.info.tx_in)
                .collect()
        };
        for tx_in in slaves {
            self.base.services.wallet.lock_outpoint(tx_in).await;
        }
    }

    /// Reverts `Processing*` slaves stuck past `SERVICENODE_MAX_PROCESSING_TIME`
    /// back to their pre-processing state (SPEC_FULL.md §4.3/§7).
    async fn revert_timed_out_processing(&self, now: i64) {
        let params = self.base.services.params;
        let mut registry = self.base.registry.lock().await;
        let stuck: Vec<_> = registry
            .iter()
            .filter_map(|(idx, e)| {
                let slave = e.as_slave()?;
                if slave.info.is_processing()
                    && now - slave.processing_start_time > params.processing_timeout_secs
                {
                    Some((idx, slave.info.state))
                } else {
                    None
                }
            })
            .collect();
        for (idx, state) in stuck {
            if let Entry::Slave(slave) = registry.get_mut(idx).unwrap() {
                let alias = slave.alias.clone();
                slave.info.state = match state {
                    State::ProcessingStart => State::Stopped,
                    State::ProcessingStop => State::Started,
                    other => other,
                };
                warn!(alias, "slave processing timed out, reverting");
            }
        }
    }

    pub async fn listen(
        &self,
        peer: std::net::SocketAddr,
        peer_protocol_version: u32,
        command: &str,
        payload: &[u8],
    ) -> bool {
        self.base
            .process_message(peer, peer_protocol_version, self, command, payload)
            .await
    }
}

#[async_trait]
impl RoleHooks for ControlNode {
    fn min_protoversion(&self, params: &OverlayParams) -> u32 {
        params.controlnode_min_protoversion
    }

    /// For a known slave, a repeat `snstrt` is accepted only if the entry
    /// has *not* been updated within the update window — stops the control
    /// node's own broadcast from looping back and repeatedly mutating its
    /// own state on every echo.
    async fn accept_start_message(&self, existing: &Entry, msg: &SnStart, now: i64) -> bool {
        match existing {
            Entry::Slave(slave) if slave.info.shared_public_key == msg.shared_public_key => {
                !slave
                    .info
                    .is_updated_within(self.base.services.params.update_window_secs, now)
            }
            _ => true,
        }
    }

    async fn on_start_accepted(&self, _node: &UtilityNode, msg: &SnStart) {
        let mut registry = self.base.registry.lock().await;
        if let Some(idx) = registry.find_by_tx_in(&msg.tx_in) {
            if let Entry::Slave(slave) = registry.get_mut(idx).unwrap() {
                if slave.info.state == State::ProcessingStart {
                    slave.info.state = State::Started;
                    info!(alias = %slave.alias, "slave node confirmed Started (self echo)");
                }
            }
        }
    }

    async fn on_stop_accepted(&self, _node: &UtilityNode, msg: &SnStop) {
        let mut registry = self.base.registry.lock().await;
        if let Some(idx) = registry.find_by_tx_in(&msg.tx_in) {
            if let Entry::Slave(slave) = registry.get_mut(idx).unwrap() {
                if slave.info.state == State::ProcessingStop {
                    slave.info.state = State::Stopped;
                    info!(alias = %slave.alias, "slave node confirmed Stopped (self echo)");
                }
            }
        }
    }

    async fn on_maintenance(&self, _node: &UtilityNode, now: i64) {
        self.update_locks().await;
        self.revert_timed_out_processing(now).await;
    }
}

/// Parses a base58check P2PKH address string down to its hash160, the form
/// `AvailableCoins`/`get_public_key` key on. Returns `None` for anything that
/// isn't a standard pay-to-pubkey-hash address.
fn parse_address_hash160(address: &str) -> Option<crate::types::Hash160> {
    let addr = bitcoin::Address::from_str(address)
        .ok()?
        .assume_checked();
    match addr.address_type() {
        Some(bitcoin::AddressType::P2pkh) => {
            let script = addr.script_pubkey();
            let bytes = script.as_bytes();
            if bytes.len() == 25 {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes[3..23]);
                Some(crate::types::Hash160::new(hash))
            } else {
                None
            }
        }
        _ => None,
    }
}

use std::str::FromStr;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{AvailableCoin, Services};
    use crate::types::Hash;
    use std::net::{IpAddr, Ipv4Addr};

    fn testnet_services() -> (
        Services,
        std::sync::Arc<crate::services::InMemoryChain>,
        std::sync::Arc<crate::services::InMemoryMempool>,
        std::sync::Arc<crate::services::InMemoryWallet>,
        std::sync::Arc<crate::services::InMemoryTransport>,
        std::sync::Arc<crate::services::FixedClock>,
    ) {
        Services::test_doubles(OverlayParams::new(crate::services::ChainParams::testnet()))
    }

    fn sample_slave(alias: &str) -> SlaveConfig {
        SlaveConfig {
            alias: alias.to_string(),
            wallet_address: "n1tJYLcLrVYSCXsEkFCtFmUJWdmRA1WqsL".to_string(),
            inet_address: NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999),
            shared_private_key: bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
        }
    }

    #[tokio::test]
    async fn load_slaves_rejects_duplicate_alias() {
        let (services, ..) = testnet_services();
        let node = ControlNode::new(services);
        node.load_slaves(vec![sample_slave("alpha")]).await.unwrap();
        let err = node.load_slaves(vec![sample_slave("alpha")]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn start_slave_node_unknown_alias_errors() {
        let (services, ..) = testnet_services();
        let node = ControlNode::new(services);
        let err = node.start_slave_node("ghost").await;
        assert!(matches!(err, Err(OperatorError::UnknownAlias(_))));
    }

    #[tokio::test]
    async fn start_slave_node_without_collateral_errors() {
        let (services, ..) = testnet_services();
        let node = ControlNode::new(services);
        node.load_slaves(vec![sample_slave("alpha")]).await.unwrap();
        let err = node.start_slave_node("alpha").await;
        assert!(matches!(err, Err(OperatorError::NoCollateralFound { .. })));
    }

    #[tokio::test]
    async fn start_slave_node_happy_path_reaches_processing_start() {
        let (services, _chain, _mempool, wallet, transport, _clock) = testnet_services();
        let wallet_key = Keypair::generate();
        let address = bitcoin::Address::p2pkh(
            bitcoin::PublicKey::new(wallet_key.public_key().0),
            bitcoin::Network::Testnet,
        )
        .to_string();

        let node = ControlNode::new(services.clone());
        node.load_slaves(vec![SlaveConfig {
            alias: "alpha".to_string(),
            wallet_address: address,
            inet_address: NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999),
            shared_private_key: bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
        }])
        .await
        .unwrap();

        wallet.add_key(&wallet_key).await;
        wallet
            .add_coin(AvailableCoin {
                tx_in: TxIn::new(Hash::zero(), 0),
                amount_sats: services.params.chain.collateral_amount_sats,
                address_pubkey_hash: wallet_key.public_key().hash160(),
                confirmations: services.params.chain.min_confirmations,
            })
            .await;

        node.start_slave_node("alpha").await.unwrap();

        let registry = node.base.registry.lock().await;
        let idx = registry.find_slave_by_alias("alpha").unwrap();
        let slave = registry.get(idx).unwrap().as_slave().unwrap();
        assert_eq!(slave.info.state, State::ProcessingStart);
        drop(registry);
        assert_eq!(transport.relayed().await.len(), 1);
    }
}
