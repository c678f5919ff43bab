//! The replicated service-node registry.
//!
//! Re-architected per the redesign flags in SPEC_FULL.md §9: the source's
//! shared-pointer vector with ad-hoc back-pointers becomes a plain arena
//! (`Vec<Entry>`) with a primary index on `TxIn` and secondary indices on
//! `inet_address`/`shared_public_key`/`wallet_public_key`. External
//! references are `Index(usize)`, never pointers. Generic entries and
//! control-node slave entries share one arena and one `TxIn` keyspace
//! (`Entry::Generic` / `Entry::Slave`), so `find_by_any_key` and the
//! never-auto-remove rule for slaves fall out of one `Entry` match instead
//! of two parallel collections.

use crate::net::types::NetAddress;
use crate::types::{PublicKey, Signature, TxIn};
use std::collections::HashMap;

/// Lifecycle state of a service-node entry (SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Stopped,
    Started,
    ProcessingStart,
    ProcessingStop,
}

impl Default for State {
    fn default() -> Self {
        State::Stopped
    }
}

/// An index into the registry arena. Never dereferenced directly; always
/// looked up through `Registry::get`/`get_mut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index(pub usize);

/// Common fields of every registry row (`CServiceNodeInfo` in the original).
#[derive(Debug, Clone)]
pub struct ServiceNodeInfo {
    pub tx_in: TxIn,
    pub inet_address: NetAddress,
    pub wallet_public_key: PublicKey,
    pub shared_public_key: PublicKey,
    pub signature: Signature,
    pub signature_time: i64,
    pub last_ping: i64,
    pub last_start: i64,
    pub last_stop: i64,
    pub last_seen: i64,
    pub time_stopped: i64,
    pub service_node_count: i32,
    pub service_node_index: i32,
    pub state: State,
}

impl ServiceNodeInfo {
    pub fn is_updated_within(&self, window_secs: i64, now: i64) -> bool {
        now - self.last_seen < window_secs
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state, State::ProcessingStart | State::ProcessingStop)
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, State::Started)
    }
}

/// Control-node-only extension (`CSlaveNodeInfo` in the original). Never
/// relayed; never auto-removed by maintenance regardless of `state`.
#[derive(Debug, Clone)]
pub struct SlaveNodeInfo {
    pub info: ServiceNodeInfo,
    pub alias: String,
    pub wallet_address: String,
    pub shared_private_key: bitcoin::secp256k1::SecretKey,
    pub processing_start_time: i64,
}

/// One row of the arena: either a plain gossip-observed entry, or a local
/// control-node slave. Replaces the source's `dynamic_cast`-style type
/// discrimination with a match.
#[derive(Debug, Clone)]
pub enum Entry {
    Generic(ServiceNodeInfo),
    Slave(SlaveNodeInfo),
}

impl Entry {
    pub fn info(&self) -> &ServiceNodeInfo {
        match self {
            Entry::Generic(i) => i,
            Entry::Slave(s) => &s.info,
        }
    }

    pub fn info_mut(&mut self) -> &mut ServiceNodeInfo {
        match self {
            Entry::Generic(i) => i,
            Entry::Slave(s) => &mut s.info,
        }
    }

    pub fn as_slave(&self) -> Option<&SlaveNodeInfo> {
        match self {
            Entry::Slave(s) => Some(s),
            Entry::Generic(_) => None,
        }
    }

    pub fn as_slave_mut(&mut self) -> Option<&mut SlaveNodeInfo> {
        match self {
            Entry::Slave(s) => Some(s),
            Entry::Generic(_) => None,
        }
    }

    /// Whether maintenance should evict this row. Slaves are never
    /// auto-removed: the control node owns their lifecycle explicitly.
    pub fn is_removable(&self, removal_window_secs: i64, now: i64) -> bool {
        match self {
            Entry::Slave(_) => false,
            Entry::Generic(info) => {
                info.state == State::Stopped && now - info.time_stopped > removal_window_secs
            }
        }
    }
}

/// Which message kind a `NodeMessageRecord` was created for — determines its
/// dedup comparison and TTL (SPEC_FULL.md §9: signed messages are never
/// record-deduped; only `sninfo`/`snlist` go through this path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    GetInfo(TxIn),
    GetList,
}

/// `(peerAddress, message, time)` record used to detect replays and throttle
/// `sninfo`/`snlist` per peer.
#[derive(Debug, Clone)]
pub struct NodeMessageRecord {
    pub peer_address: std::net::SocketAddr,
    pub kind: RecordKind,
    pub time: i64,
}

impl NodeMessageRecord {
    pub fn new(peer_address: std::net::SocketAddr, kind: RecordKind, time: i64) -> Self {
        Self {
            peer_address,
            kind,
            time,
        }
    }

    /// True iff `other` is a match for dedup purposes: same peer, same kind,
    /// and for `GetInfo` the same `TxIn`.
    pub fn matches(&self, peer_address: std::net::SocketAddr, kind: RecordKind) -> bool {
        self.peer_address == peer_address && self.kind == kind
    }
}

/// Per-message-type time-to-live for request/response dedup records, in
/// seconds. `sninfo` and `snlist` get distinct windows; everything else
/// defaults to one hour (SPEC_FULL.md §3/§4.1).
pub fn record_ttl(kind: RecordKind) -> i64 {
    match kind {
        RecordKind::GetInfo(_) => 5 * 60,
        RecordKind::GetList => 60 * 60,
    }
}

/// The arena: primary store plus secondary lookup indices.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Option<Entry>>,
    by_tx_in: HashMap<TxIn, Index>,
    by_inet_address: HashMap<NetAddress, Index>,
    by_shared_public_key: HashMap<PublicKey, Index>,
    by_wallet_public_key: HashMap<PublicKey, Index>,
    requests: Vec<NodeMessageRecord>,
    responses: Vec<NodeMessageRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_tx_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tx_in.is_empty()
    }

    fn reindex(&mut self, idx: Index) {
        let entry = self.entries[idx.0].as_ref().expect("reindex on empty slot");
        let info = entry.info();
        self.by_tx_in.insert(info.tx_in, idx);
        self.by_inet_address.insert(info.inet_address, idx);
        self.by_shared_public_key.insert(info.shared_public_key, idx);
        self.by_wallet_public_key.insert(info.wallet_public_key, idx);
    }

    /// Inserts a new entry, returning its index. Caller must have already
    /// checked `by_tx_in` doesn't contain this `tx_in` (invariant 1).
    pub fn insert(&mut self, entry: Entry) -> Index {
        let idx = Index(self.entries.len());
        self.entries.push(Some(entry));
        self.reindex(idx);
        idx
    }

    pub fn get(&self, idx: Index) -> Option<&Entry> {
        self.entries.get(idx.0).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, idx: Index) -> Option<&mut Entry> {
        self.entries.get_mut(idx.0).and_then(|e| e.as_mut())
    }

    /// Re-derives secondary indices after in-place mutation of an entry's
    /// identifying fields (e.g. a `snstrt` updating `sharedPublicKey`, or
    /// `StartSlaveNode` discovering a slave's real `tx_in`). Drops any stale
    /// mapping left over from the entry's previous key values first, so a
    /// changed `tx_in`/address/key doesn't leave a dangling alias pointing
    /// at this index.
    pub fn touch(&mut self, idx: Index) {
        self.by_tx_in.retain(|_, v| *v != idx);
        self.by_inet_address.retain(|_, v| *v != idx);
        self.by_shared_public_key.retain(|_, v| *v != idx);
        self.by_wallet_public_key.retain(|_, v| *v != idx);
        self.reindex(idx);
    }

    pub fn find_by_tx_in(&self, tx_in: &TxIn) -> Option<Index> {
        self.by_tx_in.get(tx_in).copied()
    }

    /// `GetServiceNode` in the original: look up first by `tx_in`, then fall
    /// back to any of the three identifying fields.
    pub fn find_by_any_key(
        &self,
        tx_in: &TxIn,
        inet_address: &NetAddress,
        shared_public_key: &PublicKey,
        wallet_public_key: &PublicKey,
    ) -> Option<Index> {
        self.by_tx_in
            .get(tx_in)
            .or_else(|| self.by_inet_address.get(inet_address))
            .or_else(|| self.by_shared_public_key.get(shared_public_key))
            .or_else(|| self.by_wallet_public_key.get(wallet_public_key))
            .copied()
    }

    pub fn find_by_shared_key(&self, key: &PublicKey) -> Option<Index> {
        self.by_shared_public_key.get(key).copied()
    }

    pub fn find_slave_by_alias(&self, alias: &str) -> Option<Index> {
        self.iter().find_map(|(idx, entry)| match entry {
            Entry::Slave(s) if s.alias == alias => Some(idx),
            _ => None,
        })
    }

    pub fn slave_aliases(&self) -> Vec<String> {
        self.iter()
            .filter_map(|(_, e)| e.as_slave().map(|s| s.alias.clone()))
            .collect()
    }

    pub fn remove(&mut self, idx: Index) {
        if let Some(entry) = self.entries[idx.0].take() {
            let info = entry.info();
            self.by_tx_in.remove(&info.tx_in);
            self.by_inet_address.remove(&info.inet_address);
            self.by_shared_public_key.remove(&info.shared_public_key);
            self.by_wallet_public_key.remove(&info.wallet_public_key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (Index(i), e)))
    }

    pub fn started_entries(&self) -> impl Iterator<Item = (Index, &Entry)> {
        self.iter().filter(|(_, e)| e.info().is_started())
    }

    /// Maintenance sweep: expire stale `Started` rows, evict removable rows.
    /// Returns the number of entries evicted.
    pub fn sweep(&mut self, expiration_window_secs: i64, removal_window_secs: i64, now: i64) -> usize {
        let mut to_expire = Vec::new();
        let mut to_remove = Vec::new();
        for (idx, entry) in self.iter() {
            let info = entry.info();
            if info.state == State::Started && now - info.last_seen > expiration_window_secs {
                to_expire.push(idx);
            }
        }
        for idx in &to_expire {
            if let Some(entry) = self.get_mut(*idx) {
                entry.info_mut().state = State::Stopped;
                entry.info_mut().time_stopped = now;
            }
        }
        for (idx, entry) in self.iter() {
            if entry.is_removable(removal_window_secs, now) {
                to_remove.push(idx);
            }
        }
        let evicted = to_remove.len();
        for idx in to_remove {
            self.remove(idx);
        }
        evicted
    }

    pub fn record_request(&mut self, record: NodeMessageRecord) {
        self.requests.push(record);
    }

    pub fn record_response(&mut self, record: NodeMessageRecord) {
        self.responses.push(record);
    }

    pub fn has_request_record(
        &self,
        peer_address: std::net::SocketAddr,
        kind: RecordKind,
        now: i64,
    ) -> bool {
        self.requests
            .iter()
            .any(|r| r.matches(peer_address, kind) && now - r.time < record_ttl(kind))
    }

    pub fn has_response_record(
        &self,
        peer_address: std::net::SocketAddr,
        kind: RecordKind,
        now: i64,
    ) -> bool {
        self.responses
            .iter()
            .any(|r| r.matches(peer_address, kind) && now - r.time < record_ttl(kind))
    }

    /// Drops request/response records older than their per-kind TTL.
    pub fn clean_records(&mut self, now: i64) {
        self.requests.retain(|r| now - r.time < record_ttl(r.kind));
        self.responses.retain(|r| now - r.time < record_ttl(r.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn sample_info(tx_in: TxIn) -> ServiceNodeInfo {
        let wallet = Keypair::generate().public_key();
        let shared = Keypair::generate().public_key();
        ServiceNodeInfo {
            tx_in,
            inet_address: NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 39999),
            wallet_public_key: wallet,
            shared_public_key: shared,
            signature: Signature([0u8; 65]),
            signature_time: 0,
            last_ping: 0,
            last_start: 0,
            last_stop: 0,
            last_seen: 0,
            time_stopped: 0,
            service_node_count: -1,
            service_node_index: -1,
            state: State::Stopped,
        }
    }

    #[test]
    fn insert_and_find_by_tx_in() {
        let mut reg = Registry::new();
        let tx_in = TxIn::new(crate::types::Hash::zero(), 0);
        let idx = reg.insert(Entry::Generic(sample_info(tx_in)));
        assert_eq!(reg.find_by_tx_in(&tx_in), Some(idx));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn no_two_entries_share_a_tx_in_after_remove_and_reinsert() {
        let mut reg = Registry::new();
        let tx_in = TxIn::new(crate::types::Hash::zero(), 1);
        let idx1 = reg.insert(Entry::Generic(sample_info(tx_in)));
        reg.remove(idx1);
        assert_eq!(reg.find_by_tx_in(&tx_in), None);
        let idx2 = reg.insert(Entry::Generic(sample_info(tx_in)));
        assert_eq!(reg.find_by_tx_in(&tx_in), Some(idx2));
    }

    #[test]
    fn sweep_expires_stale_started_entries() {
        let mut reg = Registry::new();
        let tx_in = TxIn::new(crate::types::Hash::zero(), 2);
        let mut info = sample_info(tx_in);
        info.state = State::Started;
        info.last_seen = 0;
        reg.insert(Entry::Generic(info));
        reg.sweep(100, 10_000, 1_000);
        let idx = reg.find_by_tx_in(&tx_in).unwrap();
        assert_eq!(reg.get(idx).unwrap().info().state, State::Stopped);
    }

    #[test]
    fn sweep_evicts_long_stopped_entries_but_never_slaves() {
        let mut reg = Registry::new();
        let tx_in = TxIn::new(crate::types::Hash::zero(), 3);
        let mut info = sample_info(tx_in);
        info.state = State::Stopped;
        info.time_stopped = 0;
        reg.insert(Entry::Generic(info.clone()));

        let slave_tx_in = TxIn::new(crate::types::Hash::zero(), 4);
        let mut slave_info = info.clone();
        slave_info.tx_in = slave_tx_in;
        let slave = SlaveNodeInfo {
            info: slave_info,
            alias: "node-a".into(),
            wallet_address: "addr".into(),
            shared_private_key: bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
            processing_start_time: 0,
        };
        reg.insert(Entry::Slave(slave));

        let evicted = reg.sweep(1_000_000, 100, 1_000);
        assert_eq!(evicted, 1);
        assert_eq!(reg.find_by_tx_in(&tx_in), None);
        assert!(reg.find_by_tx_in(&slave_tx_in).is_some());
    }

    #[test]
    fn record_dedup_matches_same_peer_and_kind() {
        let mut reg = Registry::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let tx_in = TxIn::new(crate::types::Hash::zero(), 5);
        reg.record_request(NodeMessageRecord::new(peer, RecordKind::GetInfo(tx_in), 0));
        assert!(reg.has_request_record(peer, RecordKind::GetInfo(tx_in), 1));
        assert!(!reg.has_request_record(peer, RecordKind::GetList, 1));
    }

    #[test]
    fn clean_records_drops_expired() {
        let mut reg = Registry::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        reg.record_request(NodeMessageRecord::new(peer, RecordKind::GetList, 0));
        reg.clean_records(10_000);
        assert!(!reg.has_request_record(peer, RecordKind::GetList, 10_000));
    }
}
