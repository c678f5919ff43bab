//! Message signing and verification: the chain's standard "magic-prefixed"
//! scheme — `SHA256d(magic ‖ message)` signed as a 65-byte recoverable
//! compact ECDSA signature — plus WIF import/export for service-node and
//! shared keys.
//!
//! Grounded on `original_source/src/utilitynodemessage.cpp`'s `SignMessage`/
//! `VerifyMessage`, reimplemented with `bitcoin::secp256k1`'s recoverable
//! signature API instead of OpenSSL's `ECDSA_SIG_recover_key_GFp`.

use crate::error::{CryptoError, CryptoResult};
use crate::types::{Hash160, PublicKey, Signature};
use bitcoin::hashes::{sha256d, Hash as _};
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Message, PrivateKey as RawPrivateKey, Secp256k1, SecretKey};
use bitcoin::{Network, PrivateKey};
use std::str::FromStr;

/// Prefix hashed together with every message string before signing, matching
/// the chain's "Bitcoin Signed Message" convention (`strMessageMagic`).
pub const MESSAGE_MAGIC: &str = "DarkNet Signed Message:\n";

/// A keypair capable of signing overlay messages (wallet key or shared key).
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: bitcoin::secp256k1::PublicKey,
}

impl Keypair {
    /// Generates a fresh compressed secp256k1 keypair, as `GenerateSharedKey`
    /// does for a new slave's shared identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (secret, public) = secp.generate_keypair(&mut rng);
        Self { secret, public }
    }

    pub fn from_private_key(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    /// Parses a wallet-import-format private key (what `generatesharedkey`
    /// hands the operator, and what a service node installs locally).
    pub fn from_wif(wif: &str) -> CryptoResult<Self> {
        let priv_key =
            PrivateKey::from_str(wif).map_err(|e| CryptoError::InvalidWif(e.to_string()))?;
        Ok(Self::from_private_key(priv_key.inner))
    }

    /// Encodes to WIF for mainnet; the overlay always deals in mainnet-style
    /// keys even when the node itself runs on testnet, matching the original
    /// wallet's `CBitcoinSecret::SetString` round trip.
    pub fn to_wif(&self, network: Network) -> String {
        let priv_key = PrivateKey::new(self.secret, network);
        priv_key.to_wif()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public)
    }

    pub fn secret_key(&self) -> SecretKey {
        self.secret
    }

    /// Signs `message`, magic-prefixed, producing a 65-byte recoverable
    /// compact signature (1 recovery byte + 64 r/s bytes).
    pub fn sign(&self, message: &str) -> CryptoResult<Signature> {
        let digest = magic_hash(message);
        let secp = Secp256k1::new();
        let msg = Message::from_digest(digest.to_byte_array());
        let raw = RawPrivateKey::new(self.secret, Network::Bitcoin);
        let recoverable = secp.sign_ecdsa_recoverable(&msg, &raw.inner);
        let (recovery_id, compact) = recoverable.serialize_compact();
        let mut out = [0u8; 65];
        // Compact-signature header byte: 27 + recovery id (+4 for compressed
        // pubkeys), matching `CKey::SignCompact`'s on-wire convention.
        out[0] = 27 + 4 + recovery_id.to_i32() as u8;
        out[1..].copy_from_slice(&compact);
        Ok(Signature(out))
    }
}

fn magic_hash(message: &str) -> sha256d::Hash {
    let mut buf = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len());
    buf.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    buf.extend_from_slice(message.as_bytes());
    sha256d::Hash::hash(&buf)
}

/// Verifies `signature` over `message` against the claimed `expected_key`,
/// by recovering the signer's public key from the signature and comparing
/// its hash160 to `expected_key`'s — exactly as `CKey::SetCompactSignature`
/// + `GetPubKey().GetID()` does in the original.
pub fn verify(message: &str, signature: &Signature, expected_key: &PublicKey) -> bool {
    match recover(message, signature) {
        Some(recovered) => recovered.hash160() == expected_key.hash160(),
        None => false,
    }
}

/// Recovers the public key that produced `signature` over `message`, or
/// `None` if the signature is malformed or doesn't recover.
pub fn recover(message: &str, signature: &Signature) -> Option<PublicKey> {
    let header = signature.0[0];
    if !(27..=34).contains(&header) {
        return None;
    }
    let recovery_byte = (header - 27) % 4;
    let recovery_id = RecoveryId::from_i32(recovery_byte as i32).ok()?;
    let recoverable = RecoverableSignature::from_compact(&signature.0[1..], recovery_id).ok()?;

    let digest = magic_hash(message);
    let msg = Message::from_digest(digest.to_byte_array());
    let secp = Secp256k1::new();
    let pubkey = secp.recover_ecdsa(&msg, &recoverable).ok()?;
    Some(PublicKey(pubkey))
}

/// Standard pay-to-pubkey-hash check: does `key`'s hash160 match `claimed`?
pub fn matches_hash160(key: &PublicKey, claimed: &Hash160) -> bool {
    key.hash160() == *claimed
}

/// Whether `key` encodes to the standard 25-byte pay-to-pubkey-hash script
/// shape (`HandleStart`/`HandleStop` step 3). A `PublicKey` is always a
/// valid compressed secp256k1 point by construction (parsing a malformed
/// one fails at decode time), so this mirrors the source's `Solvable()`
/// check on the compression-prefix byte rather than re-deriving the script.
pub fn is_standard_pubkey(key: &PublicKey) -> bool {
    matches!(key.to_bytes()[0], 0x02 | 0x03)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = Keypair::generate();
        let msg = "snstrt1700000000127.0.0.1:39999deadbeefcafebabe";
        let sig = kp.sign(msg).unwrap();
        assert!(verify(msg, &sig, &kp.public_key()));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let msg = "snping1700000000txindata";
        let sig = kp.sign(msg).unwrap();
        assert!(!verify(msg, &sig, &other.public_key()));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::generate();
        let sig = kp.sign("snstop-original").unwrap();
        assert!(!verify("snstop-tampered", &sig, &kp.public_key()));
    }

    #[test]
    fn wif_round_trips() {
        let kp = Keypair::generate();
        let wif = kp.to_wif(Network::Bitcoin);
        let reloaded = Keypair::from_wif(&wif).unwrap();
        assert_eq!(kp.public_key(), reloaded.public_key());
    }

    #[test]
    fn from_wif_rejects_garbage() {
        assert!(Keypair::from_wif("not-a-valid-wif").is_err());
    }
}
