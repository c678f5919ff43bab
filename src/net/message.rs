//! The five-message gossip protocol: wire types, canonical signing strings,
//! and bounded (de)serialization.
//!
//! Grounded on `original_source/src/utilitynodemessage.h/.cpp`
//! (`CServiceNodeStart`/`CServiceNodeStop`/`CServiceNodePing`/
//! `CServiceNodeGetInfo`/`CServiceNodeGetList`), reimplemented as an enum
//! instead of a virtual-dispatch class hierarchy (SPEC_FULL.md §9 redesign
//! flag: "cyclic/runtime type discrimination").

use crate::crypto;
use crate::error::NetError;
use crate::net::types::NetAddress;
use crate::types::{PublicKey, Signature, TxIn};
use serde::{Deserialize, Serialize};

/// Six-byte ASCII command strings, matching the wire protocol (SPEC_FULL.md §6).
pub const CMD_START: &str = "snstrt";
pub const CMD_STOP: &str = "snstop";
pub const CMD_PING: &str = "snping";
pub const CMD_GETINFO: &str = "sninfo";
pub const CMD_GETLIST: &str = "snlist";

/// Every legitimate `snstrt`/`snstop`/`snping` payload is a handful of fixed
/// scalar fields; this is comfortably above any honest message and rejects
/// hostile oversized frames before `ProcessMessage` ever decodes them.
pub const MAX_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnStart {
    pub time: i64,
    pub tx_in: TxIn,
    pub inet_address: NetAddress,
    pub wallet_public_key: PublicKey,
    pub shared_public_key: PublicKey,
    /// `-1` sentinel: unsolicited broadcast, eligible for flood relay.
    pub count: i32,
    pub index: i32,
    pub signature: Signature,
}

impl SnStart {
    /// `"snstrt" ‖ dec(time) ‖ inetAddr ‖ walletPub ‖ sharedPub` — bit-exact,
    /// tested against the original in `tests/`.
    pub fn signing_string(
        time: i64,
        inet_address: &NetAddress,
        wallet_public_key: &PublicKey,
        shared_public_key: &PublicKey,
    ) -> String {
        format!(
            "{CMD_START}{time}{inet_address}{wallet_public_key}{shared_public_key}"
        )
    }

    pub fn message_string(&self) -> String {
        Self::signing_string(
            self.time,
            &self.inet_address,
            &self.wallet_public_key,
            &self.shared_public_key,
        )
    }

    pub fn verify(&self) -> bool {
        crypto::verify(&self.message_string(), &self.signature, &self.wallet_public_key)
    }

    /// Unsolicited-broadcast sentinel: eligible for flood relay regardless
    /// of whether admission was a fresh insert or an in-place update.
    pub fn is_unsolicited(&self) -> bool {
        self.count == -1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnStop {
    pub time: i64,
    pub tx_in: TxIn,
    pub inet_address: NetAddress,
    pub shared_public_key: PublicKey,
    pub signature: Signature,
}

impl SnStop {
    /// `"snstop" ‖ dec(time) ‖ txIn ‖ inetAddr ‖ sharedPub`.
    pub fn signing_string(
        time: i64,
        tx_in: &TxIn,
        inet_address: &NetAddress,
        shared_public_key: &PublicKey,
    ) -> String {
        format!("{CMD_STOP}{time}{tx_in}{inet_address}{shared_public_key}")
    }

    pub fn message_string(&self) -> String {
        Self::signing_string(self.time, &self.tx_in, &self.inet_address, &self.shared_public_key)
    }

    /// Verified against the **wallet** key per SPEC_FULL.md §4.1 — the same
    /// identity that started the node must be the one that stops it.
    pub fn verify(&self, wallet_public_key: &PublicKey) -> bool {
        crypto::verify(&self.message_string(), &self.signature, wallet_public_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnPing {
    pub time: i64,
    pub tx_in: TxIn,
    pub inet_address: NetAddress,
    pub shared_public_key: PublicKey,
    pub signature: Signature,
}

impl SnPing {
    /// `"snping" ‖ dec(time) ‖ txIn ‖ inetAddr ‖ sharedPub`.
    pub fn signing_string(
        time: i64,
        tx_in: &TxIn,
        inet_address: &NetAddress,
        shared_public_key: &PublicKey,
    ) -> String {
        format!("{CMD_PING}{time}{tx_in}{inet_address}{shared_public_key}")
    }

    pub fn message_string(&self) -> String {
        Self::signing_string(self.time, &self.tx_in, &self.inet_address, &self.shared_public_key)
    }

    pub fn verify(&self) -> bool {
        crypto::verify(&self.message_string(), &self.signature, &self.shared_public_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnGetInfo {
    pub tx_in: TxIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnGetList;

/// Wire message demultiplexed by `ProcessMessage`. Carries no `time` field
/// of its own for `SnGetInfo`/`SnGetList` — they are request/response
/// deduplicated, never accepted/rejected by timestamp ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Start(SnStart),
    Stop(SnStop),
    Ping(SnPing),
    GetInfo(SnGetInfo),
    GetList(SnGetList),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Start(_) => CMD_START,
            Message::Stop(_) => CMD_STOP,
            Message::Ping(_) => CMD_PING,
            Message::GetInfo(_) => CMD_GETINFO,
            Message::GetList(_) => CMD_GETLIST,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let bytes = postcard::to_allocvec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
        }
        Ok(bytes)
    }

    pub fn decode(command: &str, bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
        }
        if !matches!(command, CMD_START | CMD_STOP | CMD_PING | CMD_GETINFO | CMD_GETLIST) {
            return Err(NetError::UnknownCommand(command.to_string()));
        }
        let msg: Message = postcard::from_bytes(bytes)?;
        if msg.command() != command {
            return Err(NetError::UnknownCommand(command.to_string()));
        }
        Ok(msg)
    }
}
