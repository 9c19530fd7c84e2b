//! Global pending-join table.
//!
//! A JOIN handshake is half-open between the SYN and the completing ACK.
//! During that window the request is indexed here by the peer 4-tuple so
//! the final ACK, which carries no token, can find it. Entries are also
//! reachable from their owning connection; removal from either side must
//! tolerate the other side having already removed the entry, because a
//! JOIN completion can race connection teardown.
//!
//! Lock order: a table shard is always taken before the connection
//! (master-subflow) lock when both are needed.

use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

/// The 4-tuple a JOIN subflow will occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FourTuple {
    #[must_use]
    pub const fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

/// A half-open JOIN request.
#[derive(Debug, Clone)]
pub struct PendingJoin {
    /// Token of the owning connection.
    pub token: u32,

    /// Peer's initial subflow sequence number, from the JOIN SYN.
    pub peer_isn: u32,

    /// Our initial subflow sequence number, sent on the SYN-ACK.
    pub local_isn: u32,

    /// Address id the peer used for its source address.
    pub peer_addr_id: u8,

    /// Our address id for the local address of the new subflow.
    pub local_addr_id: u8,

    /// Nonce we generated for the SYN-ACK.
    pub local_nonce: u32,

    /// Nonce the peer sent on the SYN.
    pub peer_nonce: u32,

    /// Peer asked for backup priority.
    pub backup: bool,

    /// When this request expires.
    pub deadline: Instant,
}

/// Process-wide table of half-open JOIN requests, keyed by 4-tuple.
#[derive(Debug, Default)]
pub struct PendingJoinTable {
    map: DashMap<FourTuple, PendingJoin>,
}

impl PendingJoinTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Insert a half-open request. Returns `false` when the 4-tuple is
    /// already occupied (a retransmitted SYN; the original entry wins).
    pub fn insert(&self, key: FourTuple, pending: PendingJoin) -> bool {
        match self.map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(pending);
                true
            }
        }
    }

    /// Remove and return the request for `key`. Idempotent: a second
    /// take, or a take racing a per-connection purge, returns `None`.
    pub fn take(&self, key: &FourTuple) -> Option<PendingJoin> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// Peek without removing.
    #[must_use]
    pub fn get(&self, key: &FourTuple) -> Option<PendingJoin> {
        self.map.get(key).map(|r| r.clone())
    }

    /// Drop every request owned by `token`.
    ///
    /// Marker deletion: entries already taken by a concurrent JOIN
    /// completion are simply no longer there, which is fine.
    pub fn remove_for_token(&self, token: u32) -> usize {
        let before = self.map.len();
        self.map.retain(|_, p| p.token != token);
        let purged = before - self.map.len();
        if purged > 0 {
            debug!(token, purged, "pending joins purged");
        }
        purged
    }

    /// Expire requests whose deadline has passed. Returns the expired
    /// keys so the caller can purge per-connection syn tables too.
    pub fn expire_before(&self, now: Instant) -> Vec<FourTuple> {
        let mut expired = Vec::new();
        self.map.retain(|key, p| {
            if p.deadline <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
