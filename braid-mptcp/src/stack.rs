//! The multipath stack front object.
//!
//! Owns the process-wide pieces: the token registry, the global
//! pending-join table, the deferred work queue and the configuration.
//! Connection blocks live behind `Arc<Mutex<_>>` handles; the clone a
//! registry lookup returns is what keeps a block alive across the
//! lookup.
//!
//! Lock order: pending-join table operations complete before the
//! connection lock is taken; the two are never held together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use braid_core::config::MptcpConfig;
use braid_core::defer::{DeferredJob, WorkQueue};
use braid_core::error::{MptcpError, Result};
use braid_core::join::{FourTuple, PendingJoin, PendingJoinTable};
use braid_core::monitor::{create_monitor, ConnEventSender, ConnMonitor};
use braid_core::token::TokenRegistry;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{encode_options, MptcpOption};
use crate::handshake::{
    find_capable, find_join, generate_isn, generate_key, generate_nonce, idsn_of,
    join_auth_digest, join_auth_word, token_of,
};
use crate::mpcb::Mpcb;
use crate::subflow::{SubflowTransport, WireSegment};

/// Shared handle to one connection block.
pub type MpcbHandle = Arc<Mutex<Mpcb>>;

/// A JOIN completion whose connection lock was contended; the worker
/// finishes it.
struct ParkedJoin {
    pending: PendingJoin,
    auth: [u8; 20],
    transport: Box<dyn SubflowTransport>,
}

/// A completion the worker finished, awaiting pickup by the embedder.
struct CompletedJoin {
    token: u32,
    handle: MpcbHandle,
    path_index: u8,
}

/// Result of feeding a JOIN-completing ACK.
#[derive(Debug)]
pub enum JoinOutcome {
    /// The child subflow is attached.
    Attached { handle: MpcbHandle, path_index: u8 },

    /// The connection lock was contended; the worker will attach the
    /// subflow on the next [`MptcpStack::drain_deferred`], and the
    /// result waits in [`MptcpStack::take_completed_join`].
    Deferred,
}

struct StackInner {
    cfg: MptcpConfig,
    registry: TokenRegistry<MpcbHandle>,
    pending: PendingJoinTable,
    parked: Mutex<HashMap<FourTuple, ParkedJoin>>,
    completed: Mutex<HashMap<FourTuple, CompletedJoin>>,
    work: WorkQueue,
    events: Option<ConnEventSender>,
}

/// Authenticate and attach the child subflow of a JOIN. Shared by the
/// inline path and the deferred worker.
fn complete_join(
    mpcb: &mut Mpcb,
    key4: FourTuple,
    pending: &PendingJoin,
    auth: &[u8; 20],
    transport: Box<dyn SubflowTransport>,
) -> Result<u8> {
    let expected = join_auth_digest(
        mpcb.remote_key,
        mpcb.local_key,
        pending.peer_nonce,
        pending.local_nonce,
    );
    if *auth != expected {
        warn!(?key4, "JOIN ACK failed authentication");
        return Err(MptcpError::JoinAuthFailed);
    }
    let path_index = mpcb.paths.allocate_pi();
    mpcb.accept_join_subflow(
        path_index,
        key4.local,
        key4.remote,
        pending.local_addr_id,
        pending.peer_addr_id,
        pending.backup,
        pending.local_isn,
        pending.peer_isn,
        transport,
    );
    Ok(path_index)
}

/// Cheaply cloneable stack handle.
#[derive(Clone)]
pub struct MptcpStack {
    inner: Arc<StackInner>,
}

impl MptcpStack {
    #[must_use]
    pub fn new(cfg: MptcpConfig) -> Self {
        Self {
            inner: Arc::new(StackInner {
                cfg,
                registry: TokenRegistry::new(),
                pending: PendingJoinTable::new(),
                parked: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                work: WorkQueue::new(),
                events: None,
            }),
        }
    }

    /// Build a stack with a connection event monitor attached.
    #[must_use]
    pub fn with_monitor(cfg: MptcpConfig) -> (Self, ConnMonitor) {
        let (tx, rx) = create_monitor();
        let stack = Self {
            inner: Arc::new(StackInner {
                cfg,
                registry: TokenRegistry::new(),
                pending: PendingJoinTable::new(),
                parked: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                work: WorkQueue::new(),
                events: Some(tx),
            }),
        };
        (stack, rx)
    }

    #[must_use]
    pub fn config(&self) -> &MptcpConfig {
        &self.inner.cfg
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Allocate a key whose derived token is free, register nothing yet.
    fn fresh_key(&self) -> u64 {
        loop {
            let key = generate_key();
            if !self.inner.registry.contains(token_of(key)) {
                return key;
            }
        }
    }

    /// Open a client connection: allocates the block, registers its
    /// token and fires the master SYN through `transport`.
    pub fn connect(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        transport: Box<dyn SubflowTransport>,
    ) -> Result<MpcbHandle> {
        let key = self.fresh_key();
        let mpcb = Mpcb::new_client(
            self.inner.cfg.clone(),
            key,
            local,
            remote,
            transport,
            self.inner.events.clone(),
        )?;
        let token = mpcb.local_token;
        let handle = Arc::new(Mutex::new(mpcb));
        self.inner.registry.insert(token, Arc::clone(&handle))?;
        debug!(token, %local, %remote, "client connection registered");
        Ok(handle)
    }

    /// Begin listening: the returned listener drives server-side master
    /// handshakes and JOIN acceptance.
    #[must_use]
    pub fn listen(&self, local: SocketAddr) -> Listener {
        Listener {
            stack: self.clone(),
            local,
            syn_table: Mutex::new(HashMap::new()),
        }
    }

    /// Token lookup. The returned clone keeps the block alive.
    #[must_use]
    pub fn find(&self, token: u32) -> Option<MpcbHandle> {
        self.inner.registry.find(token)
    }

    /// Remove a connection and purge its half-open JOINs from the
    /// global table, along with any completions parked for the worker.
    /// Safe against a concurrent JOIN completion taking the same
    /// entries.
    pub fn remove(&self, token: u32) {
        self.inner.registry.remove(token);
        let purged = self.inner.pending.remove_for_token(token);
        if purged > 0 {
            debug!(token, purged, "purged pending joins on teardown");
        }
        self.inner.parked.lock().retain(|_, p| p.pending.token != token);
        self.inner.completed.lock().retain(|_, c| c.token != token);
    }

    /// Defer a release to the worker (interrupt-context call sites).
    pub fn release_deferred(&self, token: u32) {
        self.inner.work.push(DeferredJob::ReleaseMpcb { token });
    }

    /// Run deferred jobs. Runs in a context that may take connection
    /// locks; each release locks the block before dropping it from the
    /// registry, each parked JOIN completion attaches its child.
    pub fn drain_deferred(&self) {
        let work = self.inner.work.clone();
        work.drain(|job| match job {
            DeferredJob::ReleaseMpcb { token } => {
                if let Some(handle) = self.inner.registry.find(token) {
                    let _guard = handle.lock();
                    self.remove(token);
                }
            }
            DeferredJob::CompleteJoin { key } => {
                // Teardown may have purged the parked entry; gone is
                // fine (marker deletion).
                let Some(parked) = self.inner.parked.lock().remove(&key) else {
                    return;
                };
                let token = parked.pending.token;
                let Some(handle) = self.inner.registry.find(token) else {
                    return;
                };
                let mut mpcb = handle.lock();
                match complete_join(&mut mpcb, key, &parked.pending, &parked.auth, parked.transport)
                {
                    Ok(path_index) => {
                        drop(mpcb);
                        debug!(?key, path_index, "deferred JOIN completed");
                        self.inner.completed.lock().insert(
                            key,
                            CompletedJoin {
                                token,
                                handle,
                                path_index,
                            },
                        );
                    }
                    Err(err) => warn!(?key, "deferred JOIN failed: {err}"),
                }
            }
        });
    }

    /// Pick up the result of a completion the worker finished.
    pub fn take_completed_join(&self, key: &FourTuple) -> Option<(MpcbHandle, u8)> {
        self.inner
            .completed
            .lock()
            .remove(key)
            .map(|c| (c.handle, c.path_index))
    }

    /// Expire half-open JOINs past their deadline.
    pub fn expire_pending(&self, now: Instant) -> usize {
        let expired = self.inner.pending.expire_before(now);
        for key in &expired {
            debug!(?key, "pending join expired");
        }
        expired.len()
    }

    #[must_use]
    pub fn pending_join_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ------------------------------------------------------------------
    // Server-side JOIN handling
    // ------------------------------------------------------------------

    /// Process a JOIN SYN for `key4`.
    ///
    /// `opts` is the packet's option batch, parsed exactly once by the
    /// receive path and shared between routing and this handler.
    ///
    /// # Errors
    ///
    /// `TokenUnknown` when no connection owns the token: no pending
    /// entry is created and no SYN-ACK goes out, only the "required key
    /// not available" signal to the caller.
    pub fn on_join_syn(
        &self,
        key4: FourTuple,
        wire: &WireSegment,
        opts: &[MptcpOption],
    ) -> Result<WireSegment> {
        let Some(MptcpOption::JoinSyn {
            backup,
            addr_id,
            token,
            nonce,
        }) = find_join(opts).cloned()
        else {
            return Err(MptcpError::OptionMalformed {
                kind: "JOIN",
                len: wire.options.len(),
            });
        };

        let Some(handle) = self.inner.registry.find(token) else {
            warn!(token, "JOIN for unknown token");
            return Err(MptcpError::TokenUnknown { token });
        };

        let local_isn = generate_isn();
        let local_nonce = generate_nonce();
        let pending = PendingJoin {
            token,
            peer_isn: wire.seq,
            local_isn,
            peer_addr_id: addr_id,
            local_addr_id: 0,
            local_nonce,
            peer_nonce: nonce,
            backup,
            deadline: Instant::now() + self.inner.cfg.join_timeout,
        };
        // Pending-table insert completes before the connection lock is
        // taken; a retransmitted SYN keeps the original entry.
        if !self.inner.pending.insert(key4, pending) {
            debug!(?key4, "retransmitted JOIN SYN, entry kept");
        }
        let entry = self
            .inner
            .pending
            .get(&key4)
            .ok_or(MptcpError::TokenUnknown { token })?;

        let (auth, wnd) = {
            let mut mpcb = handle.lock();
            // The source address observed on the JOIN is authoritative
            // for the peer's address id.
            mpcb.note_join_source(addr_id, key4.remote);
            let auth = join_auth_word(
                mpcb.local_key,
                mpcb.remote_key,
                entry.local_nonce,
                entry.peer_nonce,
            );
            (auth, mpcb.rx.window())
        };

        let options = encode_options(&[MptcpOption::JoinSynAck {
            backup,
            addr_id: entry.local_addr_id,
            auth,
            nonce: entry.local_nonce,
        }]);
        Ok(WireSegment {
            seq: entry.local_isn,
            ack_seq: entry.peer_isn.wrapping_add(1),
            wnd,
            syn: true,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        })
    }

    /// Process the ACK completing a JOIN handshake: looks the request
    /// up by 4-tuple, authenticates, and attaches the child subflow.
    ///
    /// Receive contexts must not sleep on the connection lock, so a
    /// contended completion is parked and finished by the worker on the
    /// next [`Self::drain_deferred`].
    pub fn on_join_ack(
        &self,
        key4: FourTuple,
        wire: &WireSegment,
        opts: &[MptcpOption],
        transport: Box<dyn SubflowTransport>,
    ) -> Result<JoinOutcome> {
        let Some(MptcpOption::JoinAck { auth }) = find_join(opts) else {
            return Err(MptcpError::OptionMalformed {
                kind: "JOIN",
                len: wire.options.len(),
            });
        };

        // Idempotent take: teardown may race us and win.
        let Some(pending) = self.inner.pending.take(&key4) else {
            return Err(MptcpError::NotConnected);
        };
        let Some(handle) = self.inner.registry.find(pending.token) else {
            return Err(MptcpError::TokenUnknown {
                token: pending.token,
            });
        };

        let Some(mut mpcb) = handle.try_lock() else {
            self.inner.parked.lock().insert(
                key4,
                ParkedJoin {
                    pending,
                    auth: *auth,
                    transport,
                },
            );
            self.inner.work.push(DeferredJob::CompleteJoin { key: key4 });
            debug!(?key4, "JOIN completion parked for the worker");
            return Ok(JoinOutcome::Deferred);
        };
        let path_index = complete_join(&mut mpcb, key4, &pending, auth, transport)?;
        drop(mpcb);
        debug!(?key4, path_index, "JOIN completed");
        Ok(JoinOutcome::Attached { handle, path_index })
    }
}

/// Per-SYN state a listener keeps until the final handshake ACK.
struct ListenerSyn {
    local_key: u64,
    local_isn: u32,
    peer_isn: u32,
    capable: bool,
    peer_checksum: bool,
}

/// A listening endpoint driving server-side master handshakes.
pub struct Listener {
    stack: MptcpStack,
    local: SocketAddr,
    syn_table: Mutex<HashMap<FourTuple, ListenerSyn>>,
}

impl Listener {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Process a master SYN; returns the SYN-ACK to send. `opts` is the
    /// packet's option batch, parsed once by the receive path.
    ///
    /// The connection key (hence the token) is assigned here, before
    /// any block exists; the block is allocated when the final ACK
    /// observes CAPABLE.
    pub fn on_syn(
        &self,
        remote: SocketAddr,
        wire: &WireSegment,
        opts: &[MptcpOption],
    ) -> Result<WireSegment> {
        let capable = matches!(find_capable(opts), Some(MptcpOption::CapableSyn { .. }))
            && self.stack.config().enabled;
        let peer_checksum = matches!(
            find_capable(opts),
            Some(MptcpOption::CapableSyn { checksum: true })
        );

        let local_key = self.stack.fresh_key();
        let local_isn = generate_isn();
        let entry = ListenerSyn {
            local_key,
            local_isn,
            peer_isn: wire.seq,
            capable,
            peer_checksum,
        };
        let key4 = FourTuple::new(self.local, remote);
        self.syn_table.lock().insert(key4, entry);

        let options = if capable {
            encode_options(&[MptcpOption::CapableSynAck {
                checksum: peer_checksum || self.stack.config().checksum,
                key: local_key,
            }])
        } else {
            Bytes::new()
        };
        Ok(WireSegment {
            seq: local_isn,
            ack_seq: wire.seq.wrapping_add(1),
            wnd: self.stack.config().rcvbuf as u32,
            syn: true,
            ack: true,
            fin: false,
            rst: false,
            payload: Bytes::new(),
            options,
        })
    }

    /// Process the handshake-completing ACK. `opts` is the packet's
    /// option batch, parsed once by the receive path.
    ///
    /// Returns the new connection handle, or `None` when the peer never
    /// negotiated multipath and the child continues as plain TCP.
    pub fn on_ack(
        &self,
        remote: SocketAddr,
        wire: &WireSegment,
        opts: &[MptcpOption],
        transport: Box<dyn SubflowTransport>,
    ) -> Result<Option<MpcbHandle>> {
        let key4 = FourTuple::new(self.local, remote);
        let Some(entry) = self.syn_table.lock().remove(&key4) else {
            return Err(MptcpError::NotConnected);
        };

        let capable_ack = match find_capable(opts) {
            Some(MptcpOption::CapableAck {
                checksum,
                key,
                peer_key,
            }) if entry.capable => Some((*checksum, *key, *peer_key)),
            _ => None,
        };

        let Some((checksum, client_key, echoed_key)) = capable_ack else {
            debug!(%remote, "handshake completed without CAPABLE, plain TCP child");
            return Ok(None);
        };
        if echoed_key != entry.local_key {
            warn!(%remote, "CAPABLE ACK echoed a foreign key, plain TCP child");
            return Ok(None);
        }

        let mut cfg = self.stack.config().clone();
        cfg.checksum = cfg.checksum || checksum || entry.peer_checksum;
        let mpcb = Mpcb::new_server(
            cfg,
            entry.local_key,
            client_key,
            self.local,
            remote,
            entry.local_isn,
            entry.peer_isn,
            transport,
            self.stack.inner.events.clone(),
        );
        debug_assert_eq!(mpcb.rx.rcv_nxt, idsn_of(client_key));
        let token = mpcb.local_token;
        let handle = Arc::new(Mutex::new(mpcb));
        self.stack
            .inner
            .registry
            .insert(token, Arc::clone(&handle))?;
        debug!(token, %remote, "server connection registered");
        Ok(Some(handle))
    }
}
