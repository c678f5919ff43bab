//! Core domain types shared across the registry, message and node modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte double-SHA256 transaction hash, displayed big-endian-reversed
/// the way the chain's block explorers render it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn zero() -> Self {
        Self([0u8; 32])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// RIPEMD160(SHA256(pubkey)) — the standard P2PKH key hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash160([u8; 20]);

impl Hash160 {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash160({})", self)
    }
}

/// References a specific previous transaction output; the identity key of a
/// service-node entry (`COutPoint`/`CTxIn` in the original chain source).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_hash: Hash,
    pub prev_index: u32,
}

impl TxIn {
    pub fn new(prev_hash: Hash, prev_index: u32) -> Self {
        Self {
            prev_hash,
            prev_index,
        }
    }
}

impl fmt::Display for TxIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prev_hash, self.prev_index)
    }
}

impl fmt::Debug for TxIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxIn({})", self)
    }
}

/// Compressed secp256k1 public key (33 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_bytes")] pub bitcoin::secp256k1::PublicKey);

impl PublicKey {
    pub fn hash160(&self) -> Hash160 {
        let btc_key = bitcoin::PublicKey::new(self.0);
        Hash160::new(*btc_key.pubkey_hash().as_byte_array())
    }

    pub fn to_bytes(&self) -> [u8; 33] {
        self.0.serialize()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

mod pubkey_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        key: &bitcoin::secp256k1::PublicKey,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&key.serialize())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<bitcoin::secp256k1::PublicKey, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bitcoin::secp256k1::PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// 65-byte recoverable compact ECDSA signature, as used by every signed
/// message in the overlay (`snstrt`, `snstop`, `snping`).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 65 {
            return None;
        }
        let mut arr = [0u8; 65];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_string()[..16])
    }
}

/// Role a running process plays in the overlay. Replaces the source's
/// runtime type-tag checks (`IsServiceNode`/`IsControlNode`) with a tagged
/// variant matched in `ProcessMessage` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Plain relay/registry participant — no local identity.
    Utility,
    /// Owns exactly one collateralized identity.
    Service,
    /// Manages N local slave identities on behalf of an operator.
    Control,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txin_display_matches_signing_format() {
        let t = TxIn::new(Hash::new([1u8; 32]), 3);
        assert_eq!(t.to_string(), format!("{}:3", Hash::new([1u8; 32])));
    }

    #[test]
    fn hash_display_is_byte_reversed_hex() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0xcd;
        let h = Hash::new(bytes);
        assert!(h.to_string().starts_with("cd"));
        assert!(h.to_string().ends_with("ab"));
    }
}
