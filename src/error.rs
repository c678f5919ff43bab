//! Error taxonomies for the overlay.
//!
//! Two channels, matching the design split in SPEC_FULL.md §7: operator-facing
//! errors returned from control-node commands and RPC handlers, and lower-level
//! crypto/network errors that feed into them via `?`.

use thiserror::Error;

/// Errors surfaced to the operator (RPC layer, control-node commands).
///
/// Each variant renders to the same message family the original RPC surface
/// produced, so an operator script matching on substrings keeps working.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorError {
    #[error("this node is not a control node")]
    NotControlNode,

    #[error("chain is still syncing (initial block download)")]
    ChainSyncing,

    #[error("wallet is locked")]
    WalletLocked,

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("service node '{0}' is already started")]
    AlreadyStarted(String),

    #[error("service node '{0}' is not started")]
    NotStarted(String),

    #[error("service node '{0}' is still processing a prior request")]
    StillProcessing(String),

    #[error("no collateral output found for '{alias}': need {required} paid to its wallet address with at least {min_confirmations} confirmations")]
    NoCollateralFound {
        alias: String,
        required: u64,
        min_confirmations: u32,
    },

    #[error("collateral for '{alias}' has only {actual} confirmations, need {required}")]
    InsufficientConfirmations {
        alias: String,
        actual: u32,
        required: u32,
    },

    #[error("invalid address for '{0}'")]
    InvalidAddress(String),

    #[error("invalid key for '{0}'")]
    InvalidKey(String),

    #[error("could not connect to service node '{alias}' at {addr}")]
    ConnectFailed { alias: String, addr: String },

    #[error("failed to sign message for '{0}'")]
    SignFailed(String),
}

pub type OperatorResult<T> = Result<T, OperatorError>;

/// Signing/verification failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("signature does not recover to the claimed public key")]
    VerificationFailed,

    #[error("wallet import format decode failed: {0}")]
    InvalidWif(String),

    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Transport/network level errors, independent of peer misbehavior scoring
/// (which is reported through `PeerTransport::misbehaving`, not via `Result`).
#[derive(Debug, Error)]
pub enum NetError {
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(std::net::SocketAddr, String),

    #[error("peer {0} not found")]
    PeerNotFound(std::net::SocketAddr),

    #[error("message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetResult<T> = Result<T, NetError>;
