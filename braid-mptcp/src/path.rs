//! Path manager: address inventories and the path table.
//!
//! The address sets hold the local and remote endpoint inventories with
//! their stable 8-bit ids; the path table enumerates the usable
//! (local, remote) pairs and pins a path-index to each. Path-index 1 is
//! the master and never appears here; indices are handed out
//! monotonically and never reused for the life of the connection.

use std::net::IpAddr;

use braid_core::error::{MptcpError, Result};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Fixed cap on each address inventory.
pub const MAX_ADDR: usize = 12;

/// One address in an inventory. Port 0 acts as a wildcard on matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub id: u8,
    pub addr: IpAddr,
    pub port: u16,
    /// Local inventory only: this entry still needs an ADD_ADDR sent.
    pub advertised: bool,
}

impl AddrEntry {
    #[must_use]
    pub const fn new(id: u8, addr: IpAddr, port: u16) -> Self {
        Self {
            id,
            addr,
            port,
            advertised: false,
        }
    }
}

/// Outcome of an inventory update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrUpdate {
    Added,
    /// The id was present with a different address and was overwritten.
    Updated,
    Unchanged,
}

/// A local or remote address inventory.
///
/// Writers commit the entry count last on insertion and first on
/// removal, so a concurrent reader walking the set on the send-options
/// path never sees an uninitialized slot. With the set behind the
/// connection lock that discipline is preserved by the update order
/// below.
#[derive(Debug, Default, Clone)]
pub struct AddressSet {
    entries: SmallVec<[AddrEntry; MAX_ADDR]>,
    /// An ADD_ADDR was received since the last path-table rebuild.
    pub list_received: bool,
}

impl AddressSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddrEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AddrEntry> {
        self.entries.iter_mut()
    }

    #[must_use]
    pub fn get(&self, id: u8) -> Option<&AddrEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    #[must_use]
    pub fn find(&self, addr: IpAddr, port: u16) -> Option<&AddrEntry> {
        self.entries.iter().find(|e| e.addr == addr && e.port == port)
    }

    /// The next free id, starting from 1. Id 0 is the implicit ULID of
    /// the master pair and is never allocated.
    #[must_use]
    pub fn next_id(&self) -> u8 {
        let mut id = 1u8;
        while self.entries.iter().any(|e| e.id == id) {
            id += 1;
        }
        id
    }

    /// Apply an address advertisement (our own discovery or the peer's
    /// ADD_ADDR) under the intake rules:
    ///
    /// - id 0 is the peer's ULID and never stored
    /// - a known `(addr, port)` is a no-op
    /// - a known id with a different address is overwritten: the peer
    ///   sits behind a NAT and our observation is authoritative
    /// - a full set drops the address with a diagnostic
    pub fn add(&mut self, id: u8, addr: IpAddr, port: u16) -> Result<AddrUpdate> {
        if id == 0 {
            return Ok(AddrUpdate::Unchanged);
        }
        if self.find(addr, port).is_some() {
            return Ok(AddrUpdate::Unchanged);
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == id) {
            debug!(id, %addr, "address id rebound (NAT observation wins)");
            existing.addr = addr;
            existing.port = port;
            existing.advertised = false;
            self.list_received = true;
            return Ok(AddrUpdate::Updated);
        }
        if self.entries.len() >= MAX_ADDR {
            warn!(id, %addr, "address set full, dropping");
            return Err(MptcpError::AddressSetFull { cap: MAX_ADDR });
        }
        self.entries.push(AddrEntry::new(id, addr, port));
        self.list_received = true;
        Ok(AddrUpdate::Added)
    }

    /// Remove by id (REMOVE_ADDR or local withdrawal).
    pub fn remove_id(&mut self, id: u8) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.list_received = true;
        }
        removed
    }

    /// Entries still waiting to be advertised; marks them sent.
    pub fn take_unadvertised(&mut self) -> SmallVec<[AddrEntry; 2]> {
        let mut out = SmallVec::new();
        for e in &mut self.entries {
            if !e.advertised {
                e.advertised = true;
                out.push(*e);
            }
        }
        out
    }
}

/// One usable (local, remote) address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Path {
    pub loc_addr: IpAddr,
    pub loc_id: u8,
    pub loc_port: u16,
    pub rem_addr: IpAddr,
    pub rem_id: u8,
    pub rem_port: u16,
    pub path_index: u8,
}

impl Path {
    /// Ports match with 0 as a wildcard.
    fn matches(&self, loc_id: u8, rem_id: u8, loc_port: u16, rem_port: u16) -> bool {
        self.loc_id == loc_id
            && self.rem_id == rem_id
            && (self.loc_port == 0 || loc_port == 0 || self.loc_port == loc_port)
            && (self.rem_port == 0 || rem_port == 0 || self.rem_port == rem_port)
    }
}

/// The enumeration of candidate paths for one connection.
#[derive(Debug, Default)]
pub struct PathTable {
    paths: Vec<Path>,
    next_unused_pi: u8,
    seeded: bool,
}

impl PathTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            // Path-index 1 is reserved for the master subflow.
            next_unused_pi: 2,
            seeded: false,
        }
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Path> {
        self.paths.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[must_use]
    pub fn next_unused_pi(&self) -> u8 {
        self.next_unused_pi
    }

    #[must_use]
    pub fn by_index(&self, path_index: u8) -> Option<&Path> {
        self.paths.iter().find(|p| p.path_index == path_index)
    }

    /// Claim a path index outside the table (server-side JOIN children
    /// occupy pairs the local table never enumerated).
    pub fn allocate_pi(&mut self) -> u8 {
        let pi = self.next_unused_pi;
        self.next_unused_pi += 1;
        pi
    }

    /// Port-diversity construction: seed once with `ndiffports - 1`
    /// copies of the master pair, local port left to the stack.
    pub fn seed_ndiffports(
        &mut self,
        ndiffports: u8,
        master_local: IpAddr,
        master_remote: IpAddr,
        master_rem_port: u16,
    ) {
        if self.seeded {
            return;
        }
        self.seeded = true;
        for _ in 1..ndiffports {
            let pi = self.next_unused_pi;
            self.next_unused_pi += 1;
            self.paths.push(Path {
                loc_addr: master_local,
                loc_id: 0,
                loc_port: 0,
                rem_addr: master_remote,
                rem_id: 0,
                rem_port: master_rem_port,
                path_index: pi,
            });
        }
        debug!(paths = self.paths.len(), "path table seeded (ndiffports)");
    }

    /// Multi-address construction: recompute the cartesian product of
    /// the two inventories, minus the master pair, keeping path-indices
    /// of pairs that already existed.
    pub fn rebuild(
        &mut self,
        local: &AddressSet,
        remote: &AddressSet,
        master_local: (IpAddr, u16),
        master_remote: (IpAddr, u16),
    ) {
        let mut fresh: Vec<Path> = Vec::with_capacity(
            (local.len() + 1) * (remote.len() + 1),
        );

        // The master's own endpoints take part in the product under the
        // implicit id 0. Extra subflows from the master's address bind
        // a fresh local port, so the local side goes in as a wildcard.
        let master_loc = AddrEntry::new(0, master_local.0, 0);
        let master_rem = AddrEntry::new(0, master_remote.0, master_remote.1);

        let locals = std::iter::once(&master_loc).chain(local.iter());
        for loc in locals {
            let remotes = std::iter::once(&master_rem).chain(remote.iter());
            for rem in remotes {
                if loc.id == 0 && rem.id == 0 {
                    continue; // That pair is the master subflow.
                }
                if loc.addr.is_ipv4() != rem.addr.is_ipv4() {
                    continue;
                }
                let rem_port = if rem.port == 0 { master_remote.1 } else { rem.port };
                let path_index = match self
                    .paths
                    .iter()
                    .find(|p| p.matches(loc.id, rem.id, loc.port, rem_port))
                {
                    Some(existing) => existing.path_index,
                    None => {
                        let pi = self.next_unused_pi;
                        self.next_unused_pi += 1;
                        pi
                    }
                };
                fresh.push(Path {
                    loc_addr: loc.addr,
                    loc_id: loc.id,
                    loc_port: loc.port,
                    rem_addr: rem.addr,
                    rem_id: rem.id,
                    rem_port,
                    path_index,
                });
            }
        }

        self.paths = fresh;
        debug!(paths = self.paths.len(), next_pi = self.next_unused_pi, "path table rebuilt");
    }

    /// Drop every path using the given remote id (REMOVE_ADDR).
    pub fn drop_remote_id(&mut self, rem_id: u8) -> Vec<u8> {
        let dropped: Vec<u8> = self
            .paths
            .iter()
            .filter(|p| p.rem_id == rem_id)
            .map(|p| p.path_index)
            .collect();
        self.paths.retain(|p| p.rem_id != rem_id);
        dropped
    }
}

/// Address scope as reported by the interface enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrScope {
    Host,
    Link,
    Global,
}

/// One interface address handed to the discovery scan.
#[derive(Debug, Clone, Copy)]
pub struct IfaceAddr {
    pub addr: IpAddr,
    pub scope: AddrScope,
    pub up: bool,
}

/// The network interface enumerator contract.
pub trait AddrEnumerator {
    /// Invoke `f` once per interface address currently configured.
    fn enumerate(&self, f: &mut dyn FnMut(IfaceAddr));
}

/// A link-state notification. IPv4 and IPv6 are handled symmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up(IpAddr),
    Down(IpAddr),
}

/// Scan interface addresses into `set`.
///
/// Skips loopback, link- and host-scoped addresses, and the master's
/// own local address. Ids are assigned sequentially; the set is built
/// aside and committed in one swap so a concurrent options walk never
/// observes a half-filled inventory.
pub fn discover_local(
    set: &mut AddressSet,
    enumerator: &dyn AddrEnumerator,
    master_local: IpAddr,
) {
    let mut scanned = AddressSet::new();
    enumerator.enumerate(&mut |iface| {
        if !iface.up
            || iface.scope != AddrScope::Global
            || iface.addr.is_loopback()
            || iface.addr == master_local
        {
            return;
        }
        let id = scanned.next_id();
        // A full inventory already logged the drop.
        let _ = scanned.add(id, iface.addr, 0);
    });
    // Commit at the end of the scan.
    *set = scanned;
}
