//! `UtilityNode`: message dispatch, the registry arena, anti-spam
//! dedup, gossip relay and the sync/maintenance loops (SPEC_FULL.md §4.1).
//!
//! `ServiceNode` and `ControlNode` (in the sibling `service`/`control`
//! modules) embed one of these and delegate to it, overriding only the
//! `RoleHooks` seam — a pre-hook/post-hook pattern standing in for the
//! source's virtual-dispatch override chain (SPEC_FULL.md §9).

pub mod control;
pub mod service;

use crate::net::message::{Message, SnGetInfo, SnGetList, SnPing, SnStart, SnStop};
use crate::registry::{Entry, NodeMessageRecord, RecordKind, Registry, ServiceNodeInfo, State};
use crate::services::{
    Services, MISBEHAVE_INSUFFICIENT_CONFIRMATIONS, MISBEHAVE_PROVABLE_MALICE,
    MISBEHAVE_REPEATED_REQUEST, MISBEHAVE_SPENT_COLLATERAL, MISBEHAVE_WRONG_PORT,
};
use crate::{crypto, services::OverlayParams};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pre/post-hook seam a role plugs into the base dispatch logic. Default
/// impls give plain `UtilityNode` behavior; `ControlNode` overrides
/// `accept_start_message`, `ServiceNode` and `ControlNode` both override the
/// accepted-message hooks to drive their own local state machine.
#[async_trait]
pub trait RoleHooks: Send + Sync {
    fn min_protoversion(&self, params: &OverlayParams) -> u32 {
        params.utilitynode_min_protoversion
    }

    /// `AcceptStartMessage` override point (SPEC_FULL.md §4.3): whether a
    /// repeat `snstrt` against an already-known entry should be admitted.
    async fn accept_start_message(&self, _existing: &Entry, _msg: &SnStart, _now: i64) -> bool {
        true
    }

    async fn on_start_accepted(&self, _node: &UtilityNode, _msg: &SnStart) {}
    async fn on_stop_accepted(&self, _node: &UtilityNode, _msg: &SnStop) {}

    /// Run at the end of every `UpdateServiceNodeList` tick; `ControlNode`
    /// uses it to revert timed-out `Processing*` slaves and to lock
    /// collateral outpoints (`UpdateLocks`).
    async fn on_maintenance(&self, _node: &UtilityNode, _now: i64) {}
}

/// Plain base-role hooks: no local identity, accepts every `snstrt` as the
/// source's base `CUtilityNode` does.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseHooks;

#[async_trait]
impl RoleHooks for BaseHooks {}

#[derive(Debug, Default)]
struct SyncState {
    last_sync: i64,
    attempts: u32,
}

/// Registry + gossip core shared by every role.
pub struct UtilityNode {
    pub services: Services,
    pub registry: Mutex<Registry>,
    sync_state: Mutex<SyncState>,
}

impl UtilityNode {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            registry: Mutex::new(Registry::new()),
            sync_state: Mutex::new(SyncState::default()),
        }
    }

    /// `ProcessMessage`: version gate + type demux. Returns `false` and
    /// takes no action on a version mismatch or an undecodable/unknown
    /// payload.
    pub async fn process_message(
        &self,
        peer: SocketAddr,
        peer_protocol_version: u32,
        hooks: &dyn RoleHooks,
        command: &str,
        payload: &[u8],
    ) -> bool {
        if peer_protocol_version < hooks.min_protoversion(&self.services.params) {
            return false;
        }
        let msg = match Message::decode(command, payload) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%peer, %command, %err, "undecodable overlay message");
                return false;
            }
        };
        match msg {
            Message::Start(m) => self.handle_start(peer, m, hooks).await,
            Message::Stop(m) => self.handle_stop(peer, m, hooks).await,
            Message::Ping(m) => self.handle_ping(peer, m, hooks).await,
            Message::GetInfo(m) => self.handle_get_info(peer, m).await,
            Message::GetList(m) => self.handle_get_list(peer, m).await,
        }
    }

    /// Sends `m` to every currently connected peer.
    pub async fn relay(&self, m: Message) {
        let peers = self.services.transport.connected_peers().await;
        for peer in peers {
            self.services.transport.push_message(peer, m.clone()).await;
        }
    }

    async fn misbehave(&self, peer: SocketAddr, points: u32) {
        if points > 0 {
            warn!(%peer, points, "overlay peer misbehavior");
        }
        self.services.transport.misbehaving(peer, points).await;
    }

    /// `HandleStart` (SPEC_FULL.md §4.1) — fixed check order, first failure
    /// assesses misbehavior (where applicable) and aborts with no mutation.
    pub async fn handle_start(&self, peer: SocketAddr, m: SnStart, hooks: &dyn RoleHooks) -> bool {
        let now = self.services.now();
        let params = self.services.params;

        if self.services.chain.is_initial_block_download().await {
            return false;
        }
        if m.time > now + params.future_time_tolerance_secs {
            return false;
        }
        if !crypto::is_standard_pubkey(&m.wallet_public_key)
            || !crypto::is_standard_pubkey(&m.shared_public_key)
        {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if !m.verify() {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if m.inet_address.port != params.chain.service_port {
            self.misbehave(peer, MISBEHAVE_WRONG_PORT).await;
            return false;
        }
        let output = match self.services.chain.get_output(&m.tx_in).await {
            Some(o) => o,
            None => {
                self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
                return false;
            }
        };
        if output.amount_sats != params.chain.collateral_amount_sats
            || output.pubkey_hash != m.wallet_public_key.hash160()
        {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if self.services.mempool.is_spent_in_mempool(&m.tx_in).await {
            self.misbehave(peer, MISBEHAVE_SPENT_COLLATERAL).await;
            return false;
        }

        let mut registry = self.registry.lock().await;
        let is_new_tx_in = registry.find_by_tx_in(&m.tx_in).is_none();
        if is_new_tx_in && output.confirmations < params.chain.min_confirmations {
            drop(registry);
            self.misbehave(peer, MISBEHAVE_INSUFFICIENT_CONFIRMATIONS).await;
            return false;
        }

        let existing = registry.find_by_any_key(
            &m.tx_in,
            &m.inet_address,
            &m.shared_public_key,
            &m.wallet_public_key,
        );

        let was_update = match existing {
            Some(idx) => {
                let entry = registry.get(idx).expect("index from find_by_any_key is valid");
                if !hooks.accept_start_message(entry, &m, now).await {
                    return false;
                }
                let info = entry.info();
                if m.time < info.last_start || m.time < info.last_stop {
                    return false;
                }
                let entry_mut = registry.get_mut(idx).unwrap();
                let is_slave = matches!(entry_mut, Entry::Slave(_));
                let info = entry_mut.info_mut();
                info.tx_in = m.tx_in;
                info.inet_address = m.inet_address;
                info.wallet_public_key = m.wallet_public_key;
                info.shared_public_key = m.shared_public_key;
                info.signature = m.signature;
                info.signature_time = m.time;
                info.last_start = m.time;
                info.last_seen = now;
                info.state = State::Started;
                info.service_node_count = m.count;
                info.service_node_index = m.index;
                registry.touch(idx);
                let _ = is_slave;
                true
            }
            None => {
                let info = ServiceNodeInfo {
                    tx_in: m.tx_in,
                    inet_address: m.inet_address,
                    wallet_public_key: m.wallet_public_key,
                    shared_public_key: m.shared_public_key,
                    signature: m.signature,
                    signature_time: m.time,
                    last_ping: 0,
                    last_start: m.time,
                    last_stop: 0,
                    last_seen: now,
                    time_stopped: 0,
                    service_node_count: m.count,
                    service_node_index: m.index,
                    state: State::Started,
                };
                registry.insert(Entry::Generic(info));
                false
            }
        };
        drop(registry);

        self.services
            .transport
            .addrman_add(m.inet_address, peer.ip(), 0, now)
            .await;
        info!(tx_in = %m.tx_in, %peer, "service node started");
        hooks.on_start_accepted(self, &m).await;

        if m.is_unsolicited() || was_update {
            self.relay(Message::Start(m)).await;
        }
        true
    }

    /// `HandleStop` (SPEC_FULL.md §4.1). `snstop` carries no wallet public
    /// key field, so the signer is recovered from the signature itself and
    /// cross-checked against the collateral output and (if known) the
    /// entry's stored wallet key — see DESIGN.md for this resolved
    /// ambiguity.
    pub async fn handle_stop(&self, peer: SocketAddr, m: SnStop, hooks: &dyn RoleHooks) -> bool {
        let now = self.services.now();
        let params = self.services.params;

        if self.services.chain.is_initial_block_download().await {
            return false;
        }
        if m.time > now + params.future_time_tolerance_secs {
            return false;
        }
        if !crypto::is_standard_pubkey(&m.shared_public_key) {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        let signer = match crypto::recover(&m.message_string(), &m.signature) {
            Some(key) => key,
            None => {
                self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
                return false;
            }
        };
        if m.inet_address.port != params.chain.service_port {
            self.misbehave(peer, MISBEHAVE_WRONG_PORT).await;
            return false;
        }
        let output = match self.services.chain.get_output(&m.tx_in).await {
            Some(o) => o,
            None => {
                self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
                return false;
            }
        };
        if output.pubkey_hash != signer.hash160() {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if self.services.mempool.is_spent_in_mempool(&m.tx_in).await {
            self.misbehave(peer, MISBEHAVE_SPENT_COLLATERAL).await;
            return false;
        }

        let mut registry = self.registry.lock().await;
        let idx = match registry.find_by_tx_in(&m.tx_in) {
            Some(idx) => idx,
            None => return false,
        };
        let info = registry.get(idx).unwrap().info();
        if info.wallet_public_key != signer {
            drop(registry);
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if m.time < info.last_stop || m.time < info.last_start {
            return false;
        }
        let entry = registry.get_mut(idx).unwrap();
        let info = entry.info_mut();
        info.state = State::Stopped;
        info.time_stopped = now;
        info.last_stop = m.time;
        drop(registry);

        info!(tx_in = %m.tx_in, %peer, "service node stopped");
        hooks.on_stop_accepted(self, &m).await;
        self.relay(Message::Stop(m)).await;
        true
    }

    /// `HandlePing` (SPEC_FULL.md §4.1).
    pub async fn handle_ping(&self, peer: SocketAddr, m: SnPing, hooks: &dyn RoleHooks) -> bool {
        let now = self.services.now();
        let params = self.services.params;

        if m.time > now + params.future_time_tolerance_secs {
            return false;
        }
        if !crypto::is_standard_pubkey(&m.shared_public_key) {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }
        if !m.verify() {
            self.misbehave(peer, MISBEHAVE_PROVABLE_MALICE).await;
            return false;
        }

        let mut registry = self.registry.lock().await;
        let idx = match registry.find_by_tx_in(&m.tx_in) {
            Some(idx) => idx,
            None => {
                let kind = RecordKind::GetInfo(m.tx_in);
                let already_requested = registry.has_request_record(peer, kind, now);
                if !already_requested {
                    registry.record_request(NodeMessageRecord::new(peer, kind, now));
                }
                drop(registry);
                if !already_requested {
                    self.services
                        .transport
                        .push_message(peer, Message::GetInfo(SnGetInfo { tx_in: m.tx_in }))
                        .await;
                }
                return false;
            }
        };
        let info = registry.get(idx).unwrap().info();
        if m.time < info.last_ping {
            return false;
        }
        let entry = registry.get_mut(idx).unwrap();
        let info = entry.info_mut();
        if info.is_processing() {
            info.state = State::Started;
        }
        info.last_ping = m.time;
        let updated_within = info.is_updated_within(params.update_window_secs, now);
        if !updated_within {
            info.last_seen = now;
        }
        drop(registry);

        let _ = hooks;
        if !updated_within {
            self.relay(Message::Ping(m)).await;
        }
        true
    }

    /// `HandleGetInfo` (SPEC_FULL.md §4.1).
    pub async fn handle_get_info(&self, peer: SocketAddr, m: SnGetInfo) -> bool {
        let now = self.services.now();
        let kind = RecordKind::GetInfo(m.tx_in);
        let mut registry = self.registry.lock().await;
        let is_repeat = registry.has_response_record(peer, kind, now);
        registry.record_response(NodeMessageRecord::new(peer, kind, now));
        let reply = registry
            .find_by_tx_in(&m.tx_in)
            .and_then(|idx| registry.get(idx))
            .filter(|e| e.info().is_started())
            .map(|e| start_from_info(e.info()));
        drop(registry);

        if is_repeat {
            self.misbehave(peer, MISBEHAVE_REPEATED_REQUEST).await;
        }
        if let Some(start) = reply {
            self.services.transport.push_message(peer, Message::Start(start)).await;
        }
        true
    }

    /// `HandleGetList` (SPEC_FULL.md §4.1).
    pub async fn handle_get_list(&self, peer: SocketAddr, _m: SnGetList) -> bool {
        let now = self.services.now();
        let mut registry = self.registry.lock().await;
        let is_repeat = registry.has_response_record(peer, RecordKind::GetList, now);
        registry.record_response(NodeMessageRecord::new(peer, RecordKind::GetList, now));
        let count = registry.len() as i32;
        let starts: Vec<SnStart> = registry
            .started_entries()
            .enumerate()
            .map(|(i, (_, e))| {
                let mut start = start_from_info(e.info());
                start.count = count;
                start.index = i as i32;
                start
            })
            .collect();
        drop(registry);

        if is_repeat {
            self.misbehave(peer, MISBEHAVE_REPEATED_REQUEST).await;
        }
        for start in starts {
            self.services.transport.push_message(peer, Message::Start(start)).await;
        }
        true
    }

    /// `SyncServiceNodeList`: periodic outbound `snlist` request, throttled
    /// by cooldown and attempt count.
    pub async fn sync_service_node_list(&self) {
        if self.services.chain.is_initial_block_download().await {
            return;
        }
        let peers = self.services.transport.connected_peers().await;
        if peers.is_empty() {
            return;
        }
        let now = self.services.now();
        let params = self.services.params;

        let mut sync_state = self.sync_state.lock().await;
        if now - sync_state.last_sync < params.sync_cooldown_secs {
            return;
        }
        if sync_state.attempts >= params.sync_max_attempts {
            return;
        }
        sync_state.last_sync = now;
        sync_state.attempts += 1;
        drop(sync_state);

        let targets: Vec<SocketAddr> = {
            let mut registry = self.registry.lock().await;
            peers
                .into_iter()
                .filter(|peer| {
                    let has_record = registry.has_request_record(*peer, RecordKind::GetList, now);
                    if !has_record {
                        registry.record_request(NodeMessageRecord::new(
                            *peer,
                            RecordKind::GetList,
                            now,
                        ));
                    }
                    !has_record
                })
                .collect()
        };
        for peer in targets {
            self.services
                .transport
                .push_message(peer, Message::GetList(SnGetList))
                .await;
        }
    }

    /// `UpdateServiceNodeList`: re-verify unspent collateral, expire stale
    /// `Started` rows, evict removable rows, clean dedup records.
    pub async fn update_service_node_list(&self, hooks: &dyn RoleHooks) {
        let now = self.services.now();
        let params = self.services.params;

        let snapshot: Vec<_> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .filter(|(_, e)| e.info().is_started())
                .map(|(idx, e)| (idx, e.info().tx_in))
                .collect()
        };
        let mut to_stop = Vec::new();
        for (idx, tx_in) in snapshot {
            let still_unspent = self.services.chain.get_output(&tx_in).await.is_some()
                && !self.services.mempool.is_spent_in_mempool(&tx_in).await;
            if !still_unspent {
                to_stop.push(idx);
            }
        }

        let evicted = {
            let mut registry = self.registry.lock().await;
            for idx in to_stop {
                if let Some(entry) = registry.get_mut(idx) {
                    entry.info_mut().state = State::Stopped;
                    entry.info_mut().time_stopped = now;
                }
            }
            let evicted = registry.sweep(params.expiration_window_secs, params.removal_window_secs, now);
            registry.clean_records(now);
            evicted
        };
        if evicted > 0 {
            debug!(evicted, "maintenance sweep evicted registry entries");
        }

        hooks.on_maintenance(self, now).await;
    }
}

fn start_from_info(info: &ServiceNodeInfo) -> SnStart {
    SnStart {
        time: info.signature_time,
        tx_in: info.tx_in,
        inet_address: info.inet_address,
        wallet_public_key: info.wallet_public_key,
        shared_public_key: info.shared_public_key,
        count: info.service_node_count,
        index: info.service_node_index,
        signature: info.signature,
    }
}
