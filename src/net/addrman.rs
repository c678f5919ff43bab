//! Minimal address manager: `addrman.Add(addr, source, penalty)` from the
//! collaborator interface (SPEC_FULL.md §6), grounded on the host crate's
//! `AddrMan` but trimmed to what the overlay actually drives — admission
//! registers a gossiped peer address with a time penalty, nothing else in
//! this crate reads it back except for tests asserting it was called.

use crate::net::types::NetAddress;
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub source: IpAddr,
    /// Seconds subtracted from the entry's freshness, as the host crate's
    /// `AddrMan::Add` time-penalty parameter does for gossip-relayed (as
    /// opposed to directly observed) addresses.
    pub penalty_secs: i64,
    pub last_seen: i64,
}

#[derive(Debug, Default)]
pub struct AddrMan {
    entries: HashMap<NetAddress, AddrEntry>,
}

impl AddrMan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: NetAddress, source: IpAddr, penalty_secs: i64, now: i64) {
        if !addr.is_routable() {
            return;
        }
        self.entries.insert(
            addr,
            AddrEntry {
                source,
                penalty_secs,
                last_seen: now,
            },
        );
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
