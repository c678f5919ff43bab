//! Utility-node overlay: a gossip-based registry and liveness tracker for
//! collateralized service nodes, plus the control-node role that drives a
//! local set of slave identities through it.
//!
//! The crate is organized the way the original source's components map
//! onto it (SPEC_FULL.md §2): `registry` is the replicated table, `net`
//! is the wire protocol, `node` is the dispatch/role layer (`UtilityNode`
//! base plus `ServiceNode`/`ControlNode`), `services` is the collaborator
//! boundary (chain/mempool/wallet/transport/clock), and `rpc` is the
//! operator command surface.

pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod services;
pub mod types;

pub use error::{CryptoError, NetError, OperatorError, OperatorResult};
pub use node::control::ControlNode;
pub use node::service::ServiceNode;
pub use node::UtilityNode;
pub use rpc::{NodeHandle, RpcHandler};
pub use services::{ChainParams, OverlayParams, Services};
pub use types::{Hash, Hash160, NodeRole, PublicKey, Signature, TxIn};
