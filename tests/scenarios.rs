//! End-to-end scenarios for the utility-node overlay, exercised against the
//! in-memory `ChainView`/`MempoolView`/`WalletView`/`PeerTransport` doubles.
//!
//! Each test name matches the numbered scenario it covers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use utilitynode::crypto::Keypair;
use utilitynode::net::{Message, NetAddress, SnGetList, SnPing, SnStart, SnStop};
use utilitynode::registry::{RecordKind, State};
use utilitynode::services::{ChainOutput, ChainParams, OverlayParams, Services};
use utilitynode::types::{Hash, TxIn};
use utilitynode::UtilityNode;

fn peer(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

fn inet(port: u16) -> NetAddress {
    NetAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), port)
}

async fn fund_collateral(
    chain: &utilitynode::services::InMemoryChain,
    tx_in: TxIn,
    wallet: &Keypair,
    services: &Services,
) {
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
}

fn signed_start(
    time: i64,
    tx_in: TxIn,
    inet_address: NetAddress,
    wallet: &Keypair,
    shared: &Keypair,
    count: i32,
) -> SnStart {
    let signing = SnStart::signing_string(time, &inet_address, &wallet.public_key(), &shared.public_key());
    SnStart {
        time,
        tx_in,
        inet_address,
        wallet_public_key: wallet.public_key(),
        shared_public_key: shared.public_key(),
        count,
        index: -1,
        signature: wallet.sign(&signing).unwrap(),
    }
}

fn signed_stop(
    time: i64,
    tx_in: TxIn,
    inet_address: NetAddress,
    wallet: &Keypair,
    shared: &Keypair,
) -> SnStop {
    let signing = SnStop::signing_string(time, &tx_in, &inet_address, &shared.public_key());
    SnStop {
        time,
        tx_in,
        inet_address,
        shared_public_key: shared.public_key(),
        signature: wallet.sign(&signing).unwrap(),
    }
}

/// Scenario 1: fresh start — a valid `snstrt` admits one `Started` entry and
/// relays to every connected peer.
#[tokio::test]
async fn fresh_start_admits_and_relays() {
    let (services, chain, ..) = Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 0);
    let addr = inet(services.params.chain.service_port);
    fund_collateral(&chain, tx_in, &wallet, &services).await;

    let now = services.now();
    let start = signed_start(now, tx_in, addr, &wallet, &shared, -1);

    let sender = peer(1);
    let accepted = node.handle_start(sender, start, &utilitynode::node::BaseHooks).await;
    assert!(accepted);

    let registry = node.registry.lock().await;
    let idx = registry.find_by_tx_in(&tx_in).unwrap();
    let entry = registry.get(idx).unwrap();
    assert_eq!(entry.info().state, State::Started);
    assert_eq!(entry.info().last_seen, now);
}

/// Scenario 2: stale rebroadcast — a replayed `snstrt` with an older
/// timestamp than the entry's `lastStart` is rejected outright.
#[tokio::test]
async fn stale_rebroadcast_is_rejected() {
    let (services, chain, ..) = Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 1);
    let addr = inet(services.params.chain.service_port);
    fund_collateral(&chain, tx_in, &wallet, &services).await;

    let now = services.now();
    let first = signed_start(now, tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(1), first, &utilitynode::node::BaseHooks).await);

    let replay = signed_start(now - 1, tx_in, addr, &wallet, &shared, -1);
    let accepted = node.handle_start(peer(2), replay, &utilitynode::node::BaseHooks).await;
    assert!(!accepted);

    let registry = node.registry.lock().await;
    let idx = registry.find_by_tx_in(&tx_in).unwrap();
    assert_eq!(registry.get(idx).unwrap().info().last_start, now);
}

/// Scenario 3: collateral spend — once the collateral output disappears
/// (simulating a spend), the next maintenance tick stops the entry; far
/// enough past its removal window it is evicted.
#[tokio::test]
async fn collateral_spend_stops_then_evicts() {
    let (services, chain, _mempool, _wallet, _transport, clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 2);
    let addr = inet(services.params.chain.service_port);
    fund_collateral(&chain, tx_in, &wallet, &services).await;

    let now = services.now();
    let start = signed_start(now, tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(1), start, &utilitynode::node::BaseHooks).await);

    chain.remove_output(&tx_in).await;
    node.update_service_node_list(&utilitynode::node::BaseHooks).await;
    {
        let registry = node.registry.lock().await;
        let idx = registry.find_by_tx_in(&tx_in).unwrap();
        assert_eq!(registry.get(idx).unwrap().info().state, State::Stopped);
    }

    clock.advance(services.params.removal_window_secs + 1);
    node.update_service_node_list(&utilitynode::node::BaseHooks).await;
    let registry = node.registry.lock().await;
    assert!(registry.find_by_tx_in(&tx_in).is_none());
}

/// Scenario 4: ping for an unknown entry — the node requests `sninfo`
/// exactly once per peer within the dedup window, not on every ping.
#[tokio::test]
async fn ping_for_unknown_entry_requests_info_once() {
    let (services, _chain, _mempool, _wallet, transport, _clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 3);
    let addr = inet(services.params.chain.service_port);
    let now = services.now();
    let signing = SnPing::signing_string(now, &tx_in, &addr, &shared.public_key());
    let ping = SnPing {
        time: now,
        tx_in,
        inet_address: addr,
        shared_public_key: shared.public_key(),
        signature: shared.sign(&signing).unwrap(),
    };

    let sender = peer(7);
    assert!(!node.handle_ping(sender, ping.clone(), &utilitynode::node::BaseHooks).await);
    assert!(!node.handle_ping(sender, ping, &utilitynode::node::BaseHooks).await);

    let sent = transport.sent_to(sender).await;
    let getinfo_requests = sent
        .iter()
        .filter(|m| matches!(m, Message::GetInfo(m) if m.tx_in == tx_in))
        .count();
    assert_eq!(getinfo_requests, 1);

    let registry = node.registry.lock().await;
    assert!(registry.has_request_record(sender, RecordKind::GetInfo(tx_in), now));
}

/// Scenario 5: processing timeout — a control-node slave stuck in
/// `ProcessingStop` past the timeout reverts back to `Started`.
#[tokio::test]
async fn stop_processing_timeout_reverts_to_started() {
    use utilitynode::node::control::{ControlNode, SlaveConfig};
    use utilitynode::services::AvailableCoin;

    let (services, _chain, _mempool, wallet, _transport, clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
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
        inet_address: inet(services.params.chain.service_port),
        shared_private_key: bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
    }])
    .await
    .unwrap();

    wallet.add_key(&wallet_key).await;
    wallet
        .add_coin(AvailableCoin {
            tx_in: TxIn::new(Hash::zero(), 4),
            amount_sats: services.params.chain.collateral_amount_sats,
            address_pubkey_hash: wallet_key.public_key().hash160(),
            confirmations: services.params.chain.min_confirmations,
        })
        .await;
    node.start_slave_node("alpha").await.unwrap();

    {
        let mut registry = node.base.registry.lock().await;
        let idx = registry.find_slave_by_alias("alpha").unwrap();
        if let utilitynode::registry::Entry::Slave(slave) = registry.get_mut(idx).unwrap() {
            slave.info.state = State::Started;
        }
    }
    node.stop_slave_node("alpha").await.unwrap();
    {
        let registry = node.base.registry.lock().await;
        let idx = registry.find_slave_by_alias("alpha").unwrap();
        assert_eq!(registry.get(idx).unwrap().info().state, State::ProcessingStop);
    }

    clock.advance(services.params.processing_timeout_secs + 1);
    node.base.update_service_node_list(&node).await;

    let registry = node.base.registry.lock().await;
    let idx = registry.find_slave_by_alias("alpha").unwrap();
    assert_eq!(registry.get(idx).unwrap().info().state, State::Started);
}

/// Scenario 6: `snlist` dedup — a second `snlist` from the same peer within
/// the cooldown still answers with the list, but also scores misbehavior.
#[tokio::test]
async fn repeated_getlist_is_answered_but_scored() {
    let (services, chain, _mempool, _wallet, transport, _clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 5);
    let addr = inet(services.params.chain.service_port);
    fund_collateral(&chain, tx_in, &wallet, &services).await;
    let now = services.now();
    let start = signed_start(now, tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(9), start, &utilitynode::node::BaseHooks).await);

    let sender = peer(9);
    assert!(node.handle_get_list(sender, SnGetList).await);
    assert!(node.handle_get_list(sender, SnGetList).await);

    assert_eq!(transport.misbehaving_points(sender).await, 5);
    let replies = transport.sent_to(sender).await;
    let start_replies = replies
        .iter()
        .filter(|m| matches!(m, Message::Start(_)))
        .count();
    assert!(start_replies >= 2);
}

/// `HandleStop` rejects an `snstop` carrying the wrong port, just like
/// `HandleStart`'s identical check, and scores it as wrong-port
/// misbehavior rather than stopping the node.
#[tokio::test]
async fn stop_with_wrong_port_is_rejected() {
    let (services, chain, _mempool, _wallet, transport, _clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let tx_in = TxIn::new(Hash::zero(), 6);
    let addr = inet(services.params.chain.service_port);
    fund_collateral(&chain, tx_in, &wallet, &services).await;

    let now = services.now();
    let start = signed_start(now, tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(10), start, &utilitynode::node::BaseHooks).await);

    let wrong_port_addr = inet(services.params.chain.service_port + 1);
    let stop = signed_stop(now + 1, tx_in, wrong_port_addr, &wallet, &shared);
    let accepted = node.handle_stop(peer(10), stop, &utilitynode::node::BaseHooks).await;
    assert!(!accepted);

    let registry = node.registry.lock().await;
    let idx = registry.find_by_tx_in(&tx_in).unwrap();
    assert_eq!(registry.get(idx).unwrap().info().state, State::Started);
    drop(registry);
    assert_eq!(transport.misbehaving_points(peer(10)).await, 0);
}

/// A `snstrt` that re-keys a known entry (matched by shared/wallet key or
/// address, not by `tx_in`) onto a new collateral outpoint updates
/// `tx_in` in place, so the registry's `tx_in` index tracks the new
/// outpoint rather than leaving it stale.
#[tokio::test]
async fn start_update_rekeys_tx_in_when_collateral_changes() {
    let (services, chain, _mempool, _wallet, _transport, _clock) =
        Services::test_doubles(OverlayParams::new(ChainParams::testnet()));
    let node = UtilityNode::new(services.clone());

    let wallet = Keypair::generate();
    let shared = Keypair::generate();
    let addr = inet(services.params.chain.service_port);

    let old_tx_in = TxIn::new(Hash::zero(), 7);
    fund_collateral(&chain, old_tx_in, &wallet, &services).await;
    let now = services.now();
    let first = signed_start(now, old_tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(11), first, &utilitynode::node::BaseHooks).await);

    let new_tx_in = TxIn::new(Hash::zero(), 8);
    fund_collateral(&chain, new_tx_in, &wallet, &services).await;
    let second = signed_start(now + 1, new_tx_in, addr, &wallet, &shared, -1);
    assert!(node.handle_start(peer(11), second, &utilitynode::node::BaseHooks).await);

    let registry = node.registry.lock().await;
    let idx = registry.find_by_tx_in(&new_tx_in).unwrap();
    assert_eq!(registry.get(idx).unwrap().info().tx_in, new_tx_in);
    assert_eq!(registry.find_by_tx_in(&old_tx_in), None);
}
