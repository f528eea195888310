//! Neighbor Registry (C2): tracks the set of peers currently reachable,
//! their last-seen round and chain tip (spec §4.2). Modeled on `exonum`'s
//! `node::whitelist::Whitelist` and `node::connect_list::ConnectList`,
//! generalized with the liveness bookkeeping from
//! `original_source/net/src/neighbourhood.cpp`'s `PeerInfo`.

use crate::crypto::PublicKey;
use crate::error::RegistrationRefusalReason;
use crate::helpers::{Milliseconds, RoundNumber};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub version: u16,
    pub chain_uuid: u64,
    pub last_seq: u64,
    pub last_round: RoundNumber,
    pub last_seen: Instant,
    pub established: bool,
}

/// Outcome of a registry operation that the caller (the transport) must act
/// on by sending a reply or effecting an eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEffect {
    SendRegistration,
    SendRegistrationConfirmed,
    SendRegistrationRefused(RegistrationRefusalReason),
    SendPing,
    Evict(RegistrationRefusalReason),
    None,
}

struct Inner {
    peers: HashMap<PublicKey, PeerInfo>,
    capacity: usize,
    last_seen_timeout: Duration,
    local_version: u16,
    local_chain_uuid: u64,
}

/// Bounded, mutex-serialized map from peer key to `PeerInfo` (spec §4.2).
/// Operations are serialized by the internal mutex; iteration via `snapshot`
/// yields a consistent point-in-time copy, never a live view.
pub struct NeighborRegistry {
    inner: Mutex<Inner>,
}

impl NeighborRegistry {
    pub fn new(capacity: usize, last_seen_timeout: Milliseconds, local_version: u16, local_chain_uuid: u64) -> Self {
        NeighborRegistry {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                capacity,
                last_seen_timeout: Duration::from_millis(last_seen_timeout),
                local_version,
                local_chain_uuid,
            }),
        }
    }

    pub fn on_discovered(&self, peer: PublicKey) -> RegistryEffect {
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.len() >= inner.capacity {
            return RegistryEffect::None;
        }
        if inner.peers.contains_key(&peer) {
            return RegistryEffect::None;
        }
        inner.peers.insert(
            peer,
            PeerInfo {
                version: 0,
                chain_uuid: 0,
                last_seq: 0,
                last_round: RoundNumber::zero(),
                last_seen: Instant::now(),
                established: false,
            },
        );
        RegistryEffect::SendRegistration
    }

    pub fn on_registration_request(
        &self,
        peer: PublicKey,
        version: u16,
        chain_uuid: u64,
        last_seq: u64,
        round: RoundNumber,
    ) -> RegistryEffect {
        let mut inner = self.inner.lock().unwrap();
        if version != inner.local_version {
            return RegistryEffect::SendRegistrationRefused(RegistrationRefusalReason::BadClientVersion);
        }
        if chain_uuid != inner.local_chain_uuid {
            return RegistryEffect::SendRegistrationRefused(
                RegistrationRefusalReason::IncompatibleBlockchain,
            );
        }
        if !inner.peers.contains_key(&peer) && inner.peers.len() >= inner.capacity {
            return RegistryEffect::SendRegistrationRefused(RegistrationRefusalReason::LimitReached);
        }
        inner.peers.insert(
            peer,
            PeerInfo {
                version,
                chain_uuid,
                last_seq,
                last_round: round,
                last_seen: Instant::now(),
                established: true,
            },
        );
        RegistryEffect::SendRegistrationConfirmed
    }

    /// `onPing(peer, payload)` (spec §4.2): the wire `Ping` carries only
    /// `last_seq`, not a round, so this only ever touches `last_seq`/`last_seen`.
    pub fn on_ping(&self, peer: PublicKey, last_seq: u64) -> RegistryEffect {
        let mut inner = self.inner.lock().unwrap();
        let timeout = inner.last_seen_timeout;
        let Some(info) = inner.peers.get_mut(&peer) else {
            return RegistryEffect::None;
        };
        if info.last_seen.elapsed() > timeout {
            inner.peers.remove(&peer);
            log::debug!("evicting peer {} after missed-ping timeout", peer);
            return RegistryEffect::Evict(RegistrationRefusalReason::Timeout);
        }
        info.last_seq = last_seq;
        info.last_seen = Instant::now();
        RegistryEffect::None
    }

    /// Periodic sweep: evicts peers idle past `last_seen_timeout`, and
    /// returns the established peers that should receive a ping (spec §4.2).
    pub fn sweep(&self) -> Vec<PublicKey> {
        let mut inner = self.inner.lock().unwrap();
        let timeout = inner.last_seen_timeout;
        let stale: Vec<PublicKey> = inner
            .peers
            .iter()
            .filter(|(_, info)| info.last_seen.elapsed() > timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            inner.peers.remove(key);
            log::debug!("sweep evicting idle peer {}", key);
        }
        inner
            .peers
            .iter()
            .filter(|(_, info)| info.established)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Point-in-time snapshot: the only supported way to iterate (spec §5,
    /// "Neighbor map ... snapshot reads allowed").
    pub fn snapshot(&self) -> Vec<(PublicKey, PeerInfo)> {
        let inner = self.inner.lock().unwrap();
        inner.peers.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }
}
