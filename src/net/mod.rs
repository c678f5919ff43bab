//! Wire protocol and the narrow network-side pieces this crate owns
//! directly: address types, message (de)serialization, and the address
//! manager. The connection/encryption/ban/eviction machinery that actually
//! moves these bytes between sockets is the out-of-scope `PeerTransport`
//! collaborator (see `crate::services`).

pub mod addrman;
pub mod message;
pub mod types;

pub use addrman::AddrMan;
pub use message::{Message, SnGetInfo, SnGetList, SnPing, SnStart, SnStop, CMD_GETINFO, CMD_GETLIST, CMD_PING, CMD_START, CMD_STOP};
pub use types::NetAddress;
