//! `ServiceNode`: owns exactly one collateralized identity, emits periodic
//! `snping`, and transitions its local state by observing its own
//! `snstrt`/`snstop` echo back through the gossip layer (SPEC_FULL.md §4.2).

use super::{BaseHooks, RoleHooks, UtilityNode};
use crate::crypto::Keypair;
use crate::net::message::{Message, SnPing, SnStart, SnStop};
use crate::net::types::NetAddress;
use crate::registry::{Entry, State};
use crate::services::{Services, OverlayParams};
use crate::types::{PublicKey, TxIn};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Identity {
    tx_in: Option<TxIn>,
    signature_time: i64,
    last_ping: i64,
    state: State,
}

pub struct ServiceNode {
    pub base: UtilityNode,
    shared_key: Keypair,
    inet_address: NetAddress,
    identity: Mutex<Identity>,
}

impl ServiceNode {
    /// Initialized from a shared secret string supplied by the operator
    /// (`GenerateSharedKey`'s WIF output, installed on the remote host).
    pub fn new(services: Services, shared_key: Keypair, inet_address: NetAddress) -> Self {
        Self {
            base: UtilityNode::new(services),
            shared_key,
            inet_address,
            identity: Mutex::new(Identity::default()),
        }
    }

    pub fn shared_public_key(&self) -> PublicKey {
        self.shared_key.public_key()
    }

    pub async fn state(&self) -> State {
        self.identity.lock().await.state
    }

    pub async fn tx_in(&self) -> Option<TxIn> {
        self.identity.lock().await.tx_in
    }

    /// Inbound dispatch entry point, gated on `SERVICENODE_MIN_PROTOVERSION`.
    pub async fn process_message(
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

    /// `Ping()`, driven by the five-minute timer. Rejects when not yet
    /// `Started`; signs and relays a fresh `snping`.
    pub async fn ping(&self) -> bool {
        let (tx_in, state) = {
            let id = self.identity.lock().await;
            (id.tx_in, id.state)
        };
        let Some(tx_in) = tx_in else {
            return false;
        };
        if state != State::Started {
            return false;
        }
        let now = self.base.services.now();
        let signing_string =
            SnPing::signing_string(now, &tx_in, &self.inet_address, &self.shared_public_key());
        let signature = match self.shared_key.sign(&signing_string) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(%err, "failed to sign snping");
                return false;
            }
        };
        let ping = SnPing {
            time: now,
            tx_in,
            inet_address: self.inet_address,
            shared_public_key: self.shared_public_key(),
            signature,
        };
        if !ping.verify() {
            warn!("freshly signed snping failed self-verification");
            return false;
        }
        {
            let mut id = self.identity.lock().await;
            id.last_ping = now;
        }
        self.base.relay(Message::Ping(ping)).await;
        true
    }
}

#[async_trait]
impl RoleHooks for ServiceNode {
    fn min_protoversion(&self, params: &OverlayParams) -> u32 {
        params.servicenode_min_protoversion
    }

    async fn accept_start_message(&self, existing: &Entry, msg: &SnStart, now: i64) -> bool {
        BaseHooks.accept_start_message(existing, msg, now).await
    }

    async fn on_start_accepted(&self, _node: &UtilityNode, msg: &SnStart) {
        if msg.shared_public_key != self.shared_public_key() {
            return;
        }
        let mut id = self.identity.lock().await;
        id.tx_in = Some(msg.tx_in);
        id.signature_time = msg.time;
        id.state = State::Started;
        info!(tx_in = %msg.tx_in, "service node transitioned to Started (self echo)");
    }

    async fn on_stop_accepted(&self, _node: &UtilityNode, msg: &SnStop) {
        if msg.shared_public_key != self.shared_public_key() {
            return;
        }
        let mut id = self.identity.lock().await;
        id.state = State::Stopped;
        info!(tx_in = %msg.tx_in, "service node transitioned to Stopped (self echo)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ChainOutput, OverlayParams, Services};
    use crate::types::Hash;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn ping_rejected_before_started() {
        let (services, ..) = Services::test_doubles(OverlayParams::new(crate::services::ChainParams::testnet()));
        let node = ServiceNode::new(
            services,
            Keypair::generate(),
            NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999),
        );
        assert!(!node.ping().await);
    }

    #[tokio::test]
    async fn own_start_echo_transitions_to_started() {
        let (services, chain, ..) =
            Services::test_doubles(OverlayParams::new(crate::services::ChainParams::testnet()));
        let shared = Keypair::generate();
        let wallet = Keypair::generate();
        let inet = NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999);
        let node = ServiceNode::new(services.clone(), shared.clone(), inet);

        let tx_in = TxIn::new(Hash::zero(), 0);
        chain
            .set_output(
                tx_in,
                ChainOutput {
                    amount_sats: services.params.chain.collateral_amount_sats,
                    pubkey_hash: wallet.public_key().hash160(),
                    confirmations: services.params.chain.min_confirmations,
                },
            )
            .await;

        let time = services.now();
        let signing = SnStart::signing_string(time, &inet, &wallet.public_key(), &shared.public_key());
        let start = SnStart {
            time,
            tx_in,
            inet_address: inet,
            wallet_public_key: wallet.public_key(),
            shared_public_key: shared.public_key(),
            count: -1,
            index: -1,
            signature: wallet.sign(&signing).unwrap(),
        };
        let peer: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(node.base.handle_start(peer, start, &node).await);
        assert_eq!(node.state().await, State::Started);
        assert_eq!(node.tx_in().await, Some(tx_in));
    }
}
