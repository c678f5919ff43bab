//! Collaborator seams (SPEC_FULL.md §1, §6): the chain/mempool/wallet/peer
//! transport/clock are external services this crate consumes but does not
//! own. Each is a narrow async trait; an in-memory implementation of each is
//! provided for this crate's own tests, grounded on the host crate's
//! convention of keeping collaborator seams trait-bounded and testable
//! (`ChainView`/`MempoolView`/`WalletView`/`PeerTransport`/`Clock`).
//!
//! Replaces the source's global mutable singletons (`pNodeMain`,
//! `pwalletMain`) with an explicit `Services` bundle threaded through every
//! entry point (SPEC_FULL.md §9 redesign flag).

use crate::error::NetError;
use crate::net::{AddrMan, Message, NetAddress};
use crate::types::{Hash160, PublicKey, Signature, TxIn};
use async_trait::async_trait;
use bitcoin::secp256k1::SecretKey;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Chain parameters that differ between mainnet and testnet
/// (`CONTROLNODE_COINS_REQUIRED`, `CONTROLNODE_MIN_CONFIRMATIONS`, the
/// service port — from `original_source/src/utilitynode.h`).
#[derive(Debug, Clone, Copy)]
pub struct ChainParams {
    /// Exact collateral amount required, in satoshis.
    pub collateral_amount_sats: u64,
    pub min_confirmations: u32,
    pub service_port: u16,
    pub network: bitcoin::Network,
}

impl ChainParams {
    pub const fn mainnet() -> Self {
        Self {
            collateral_amount_sats: 1_000_000 * 100_000_000,
            min_confirmations: 15,
            service_port: 9999,
            network: bitcoin::Network::Bitcoin,
        }
    }

    pub const fn testnet() -> Self {
        Self {
            collateral_amount_sats: 1_000 * 100_000_000,
            min_confirmations: 1,
            service_port: 19999,
            network: bitcoin::Network::Testnet,
        }
    }
}

/// Timing/protocol constants shared by every role (SPEC_FULL.md §4/§5).
#[derive(Debug, Clone, Copy)]
pub struct OverlayParams {
    pub chain: ChainParams,
    pub utilitynode_min_protoversion: u32,
    pub servicenode_min_protoversion: u32,
    pub controlnode_min_protoversion: u32,
    pub future_time_tolerance_secs: i64,
    pub expiration_window_secs: i64,
    pub removal_window_secs: i64,
    pub update_window_secs: i64,
    pub sync_cooldown_secs: i64,
    pub sync_max_attempts: u32,
    pub processing_timeout_secs: i64,
}

impl OverlayParams {
    pub const fn new(chain: ChainParams) -> Self {
        Self {
            chain,
            utilitynode_min_protoversion: 70_000,
            servicenode_min_protoversion: 70_000,
            controlnode_min_protoversion: 70_000,
            future_time_tolerance_secs: 3600,
            expiration_window_secs: 3600,
            removal_window_secs: 3600,
            update_window_secs: 3600,
            sync_cooldown_secs: 300,
            sync_max_attempts: 3,
            processing_timeout_secs: 600,
        }
    }
}

/// Network-adjusted UNIX-second clock, swappable for a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64
    }
}

/// A fixed clock, settable by tests to exercise time-window boundaries
/// deterministically.
pub struct FixedClock(pub std::sync::atomic::AtomicI64);

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// A chain-confirmed output, as consulted for collateral validation
/// (`FetchInputs`/`ConnectInputs` in the original).
#[derive(Debug, Clone, Copy)]
pub struct ChainOutput {
    pub amount_sats: u64,
    pub pubkey_hash: Hash160,
    pub confirmations: u32,
}

/// `IsInitialBlockDownload()`, `GetTransaction`, confirmation depth — the
/// block/transaction store collaborator.
#[async_trait]
pub trait ChainView: Send + Sync {
    async fn is_initial_block_download(&self) -> bool;
    async fn get_output(&self, tx_in: &TxIn) -> Option<ChainOutput>;
}

/// Mempool's "nextTx" double-spend index.
#[async_trait]
pub trait MempoolView: Send + Sync {
    async fn is_spent_in_mempool(&self, tx_in: &TxIn) -> bool;
}

/// One spendable coin as returned by `AvailableCoins()`.
#[derive(Debug, Clone, Copy)]
pub struct AvailableCoin {
    pub tx_in: TxIn,
    pub amount_sats: u64,
    pub address_pubkey_hash: Hash160,
    pub confirmations: u32,
}

/// Wallet collaborator: key storage, signing, coin enumeration, outpoint
/// locking. Out of scope per §1; modeled here as a narrow async trait.
#[async_trait]
pub trait WalletView: Send + Sync {
    async fn is_locked(&self) -> bool;
    /// Public key controlling `address` (by its hash160), if held.
    async fn get_public_key(&self, address: &Hash160) -> Option<PublicKey>;
    async fn available_coins(&self) -> Vec<AvailableCoin>;
    async fn lock_outpoint(&self, tx_in: TxIn);
    async fn unlock_outpoint(&self, tx_in: TxIn);
    async fn is_locked_outpoint(&self, tx_in: &TxIn) -> bool;
    /// Signs `message` with the private key controlling `address` (by its
    /// hash160), the way `CWallet::SignMessage` signs on the caller's behalf
    /// without ever handing back the key itself. `None` if the wallet
    /// doesn't hold that key.
    async fn sign_with_address(&self, address: &Hash160, message: &str) -> Option<Signature>;
}

/// Misbehavior score delivered to the transport (SPEC_FULL.md §7).
pub const MISBEHAVE_PROVABLE_MALICE: u32 = 100;
pub const MISBEHAVE_INSUFFICIENT_CONFIRMATIONS: u32 = 20;
pub const MISBEHAVE_SPENT_COLLATERAL: u32 = 10;
pub const MISBEHAVE_REPEATED_REQUEST: u32 = 5;
pub const MISBEHAVE_WRONG_PORT: u32 = 0;

/// Base P2P transport collaborator: connection, framing, misbehavior
/// accounting, address manager (`ConnectNode`/`PushMessage`/`Misbehaving`/
/// `addrman.Add`, all under `cs_vNodes`).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// All currently connected peer addresses (`vNodes` under its lock).
    async fn connected_peers(&self) -> Vec<SocketAddr>;
    async fn push_message(&self, peer: SocketAddr, message: Message);
    async fn misbehaving(&self, peer: SocketAddr, points: u32);
    /// Attempts a fresh outbound connection; `None` on failure/timeout.
    async fn connect(&self, addr: NetAddress) -> Option<SocketAddr>;
    async fn addrman_add(&self, addr: NetAddress, source: IpAddr, penalty_secs: i64, now: i64);
}

/// Everything a `UtilityNode`/`ServiceNode`/`ControlNode` needs from the
/// outside world, bundled so every entry point takes one reference instead
/// of reaching for a global (SPEC_FULL.md §9).
#[derive(Clone)]
pub struct Services {
    pub params: OverlayParams,
    pub clock: Arc<dyn Clock>,
    pub chain: Arc<dyn ChainView>,
    pub mempool: Arc<dyn MempoolView>,
    pub wallet: Arc<dyn WalletView>,
    pub transport: Arc<dyn PeerTransport>,
}

impl Services {
    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}

// ---------------------------------------------------------------------
// In-memory test doubles
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryChain {
    pub outputs: Mutex<HashMap<TxIn, ChainOutput>>,
    pub ibd: std::sync::atomic::AtomicBool,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_output(&self, tx_in: TxIn, output: ChainOutput) {
        self.outputs.lock().await.insert(tx_in, output);
    }

    pub async fn remove_output(&self, tx_in: &TxIn) {
        self.outputs.lock().await.remove(tx_in);
    }

    pub fn set_ibd(&self, ibd: bool) {
        self.ibd.store(ibd, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainView for InMemoryChain {
    async fn is_initial_block_download(&self) -> bool {
        self.ibd.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn get_output(&self, tx_in: &TxIn) -> Option<ChainOutput> {
        self.outputs.lock().await.get(tx_in).copied()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMempool {
    pub spent: Mutex<HashSet<TxIn>>,
}

impl InMemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_spent(&self, tx_in: TxIn) {
        self.spent.lock().await.insert(tx_in);
    }
}

#[async_trait]
impl MempoolView for InMemoryMempool {
    async fn is_spent_in_mempool(&self, tx_in: &TxIn) -> bool {
        self.spent.lock().await.contains(tx_in)
    }
}

#[derive(Default)]
pub struct InMemoryWallet {
    pub locked: std::sync::atomic::AtomicBool,
    pub keys: Mutex<HashMap<Hash160, (SecretKey, PublicKey)>>,
    pub coins: Mutex<Vec<AvailableCoin>>,
    pub locked_outpoints: Mutex<HashSet<TxIn>>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_key(&self, keypair: &crate::crypto::Keypair) {
        let pk = keypair.public_key();
        self.keys
            .lock()
            .await
            .insert(pk.hash160(), (keypair.secret_key(), pk));
    }

    pub async fn add_coin(&self, coin: AvailableCoin) {
        self.coins.lock().await.push(coin);
    }
}

#[async_trait]
impl WalletView for InMemoryWallet {
    async fn is_locked(&self) -> bool {
        self.locked.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn get_public_key(&self, address: &Hash160) -> Option<PublicKey> {
        self.keys.lock().await.get(address).map(|(_, pk)| *pk)
    }

    async fn available_coins(&self) -> Vec<AvailableCoin> {
        self.coins.lock().await.clone()
    }

    async fn lock_outpoint(&self, tx_in: TxIn) {
        self.locked_outpoints.lock().await.insert(tx_in);
    }

    async fn unlock_outpoint(&self, tx_in: TxIn) {
        self.locked_outpoints.lock().await.remove(&tx_in);
    }

    async fn is_locked_outpoint(&self, tx_in: &TxIn) -> bool {
        self.locked_outpoints.lock().await.contains(tx_in)
    }

    async fn sign_with_address(&self, address: &Hash160, message: &str) -> Option<Signature> {
        let keys = self.keys.lock().await;
        let (secret, _) = keys.get(address)?;
        crate::crypto::Keypair::from_private_key(*secret).sign(message).ok()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPush {
    pub peer: SocketAddr,
    pub message: Message,
}

#[derive(Default)]
pub struct InMemoryTransport {
    pub peers: Mutex<Vec<SocketAddr>>,
    pub sent: Mutex<Vec<RecordedPush>>,
    pub misbehavior: Mutex<HashMap<SocketAddr, u32>>,
    pub addrman: Mutex<AddrMan>,
    pub connect_fails: Mutex<HashSet<SocketAddr>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_peer(&self, addr: SocketAddr) {
        self.peers.lock().await.push(addr);
    }

    pub async fn sent_to(&self, peer: SocketAddr) -> Vec<Message> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|p| p.peer == peer)
            .map(|p| p.message.clone())
            .collect()
    }

    pub async fn relayed(&self) -> Vec<Message> {
        self.sent.lock().await.iter().map(|p| p.message.clone()).collect()
    }

    pub async fn misbehaving_points(&self, peer: SocketAddr) -> u32 {
        *self.misbehavior.lock().await.get(&peer).unwrap_or(&0)
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().await.clone()
    }

    async fn push_message(&self, peer: SocketAddr, message: Message) {
        self.sent.lock().await.push(RecordedPush { peer, message });
    }

    async fn misbehaving(&self, peer: SocketAddr, points: u32) {
        *self.misbehavior.lock().await.entry(peer).or_insert(0) += points;
    }

    async fn connect(&self, addr: NetAddress) -> Option<SocketAddr> {
        let socket = addr.socket_addr();
        if self.connect_fails.lock().await.contains(&socket) {
            return None;
        }
        self.peers.lock().await.push(socket);
        Some(socket)
    }

    async fn addrman_add(&self, addr: NetAddress, source: IpAddr, penalty_secs: i64, now: i64) {
        self.addrman.lock().await.add(addr, source, penalty_secs, now);
    }
}

impl Services {
    /// Convenience constructor wiring the in-memory doubles together, used
    /// throughout this crate's own test suite.
    pub fn test_doubles(params: OverlayParams) -> (Self, Arc<InMemoryChain>, Arc<InMemoryMempool>, Arc<InMemoryWallet>, Arc<InMemoryTransport>, Arc<FixedClock>) {
        let chain = Arc::new(InMemoryChain::new());
        let mempool = Arc::new(InMemoryMempool::new());
        let wallet = Arc::new(InMemoryWallet::new());
        let transport = Arc::new(InMemoryTransport::new());
        let clock = Arc::new(FixedClock::new(1_700_000_000));
        let services = Services {
            params,
            clock: clock.clone() as Arc<dyn Clock>,
            chain: chain.clone() as Arc<dyn ChainView>,
            mempool: mempool.clone() as Arc<dyn MempoolView>,
            wallet: wallet.clone() as Arc<dyn WalletView>,
            transport: transport.clone() as Arc<dyn PeerTransport>,
        };
        (services, chain, mempool, wallet, transport, clock)
    }
}

/// Surfaced for the `NetError` path when a collaborator call itself fails at
/// the transport boundary (reserved for future transport implementations;
/// the in-memory double never returns it).
pub type ServiceResult<T> = Result<T, NetError>;
