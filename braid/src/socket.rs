//! Blocking meta-socket facade.
//!
//! Wraps a connection handle with the classical send/recv/close surface.
//! The engine itself is sans-IO, so the facade leans on a [`Driver`]
//! to move the world forward while an operation waits: the loopback
//! fabric pumps queues, a real embedder would park on its own readiness
//! notifications instead.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use braid_core::error::{MptcpError, Result};
use braid_mptcp::mpcb::{MetaState, MpcbAction};
use braid_mptcp::stack::{MpcbHandle, MptcpStack};

use crate::loopback::PlainEndpoint;

/// Default blocking-operation timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Advances the world while a blocking operation waits.
pub trait Driver: Send + Sync {
    /// Deliver pending traffic.
    fn drive(&self);

    /// Carry out engine actions (open subflows, release blocks).
    fn execute(&self, handle: &MpcbHandle, stack: &MptcpStack, actions: &[MpcbAction]);
}

/// The single socket an application sees for a multipath connection.
pub struct MetaSocket {
    handle: MpcbHandle,
    stack: MptcpStack,
    driver: Arc<dyn Driver>,
}

impl MetaSocket {
    #[must_use]
    pub fn new(handle: MpcbHandle, stack: MptcpStack, driver: Arc<dyn Driver>) -> Self {
        Self {
            handle,
            stack,
            driver,
        }
    }

    /// The underlying connection handle.
    #[must_use]
    pub fn handle(&self) -> &MpcbHandle {
        &self.handle
    }

    #[must_use]
    pub fn token(&self) -> u32 {
        self.handle.lock().local_token
    }

    #[must_use]
    pub fn state(&self) -> MetaState {
        self.handle.lock().state
    }

    /// Bytes ready for reading.
    #[must_use]
    pub fn available(&self) -> usize {
        self.handle.lock().available()
    }

    #[must_use]
    pub fn subflow_count(&self) -> usize {
        self.handle.lock().cnt_subflows()
    }

    /// Send the whole buffer, blocking while the send buffer drains.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let deadline = Instant::now() + IO_TIMEOUT;
        let mut sent = 0;
        while sent < buf.len() {
            let result = { self.handle.lock().send(&buf[sent..]) };
            match result {
                Ok(n) => {
                    sent += n;
                    self.driver.drive();
                }
                Err(MptcpError::WouldBlock | MptcpError::NotConnected) => {
                    if Instant::now() >= deadline {
                        return if sent > 0 {
                            Ok(sent)
                        } else {
                            Err(MptcpError::Timeout)
                        };
                    }
                    self.driver.drive();
                    std::thread::yield_now();
                }
                Err(err) => return Err(err),
            }
        }
        Ok(sent)
    }

    /// Receive into `buf`, blocking up to the default timeout.
    /// Returns 0 at end of stream.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_timeout(buf, IO_TIMEOUT)
    }

    /// Receive with an explicit timeout.
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            self.driver.drive();
            let (n, eof, state) = {
                let mut mpcb = self.handle.lock();
                let (n, eof) = mpcb.recv(buf);
                (n, eof, mpcb.state)
            };
            if n > 0 {
                return Ok(n);
            }
            if eof || state == MetaState::Closed {
                return Ok(0);
            }
            if Instant::now() >= deadline {
                return Err(MptcpError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Start the orderly close (DATA_FIN) sequence.
    pub fn close(&self) -> Result<()> {
        self.handle.lock().close()?;
        self.driver.drive();
        Ok(())
    }

    /// Publish an additional local address; new paths are joined
    /// immediately when the connection is established.
    pub fn add_local_address(&self, addr: IpAddr) -> Result<()> {
        let actions = { self.handle.lock().add_local_address(addr)? };
        self.driver.execute(&self.handle, &self.stack, &actions);
        Ok(())
    }

    /// Declare a subflow potentially failed (stall detection).
    pub fn mark_potentially_failed(&self, path_index: u8) -> Result<()> {
        self.handle.lock().mark_potentially_failed(path_index)?;
        self.driver.drive();
        Ok(())
    }
}

/// Accept side of the facade.
pub struct MetaListener {
    accept_rx: flume::Receiver<MpcbHandle>,
    plain_rx: flume::Receiver<PlainEndpoint>,
    stack: MptcpStack,
    driver: Arc<dyn Driver>,
}

impl MetaListener {
    pub(crate) fn new(
        accept_rx: flume::Receiver<MpcbHandle>,
        plain_rx: flume::Receiver<PlainEndpoint>,
        stack: MptcpStack,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            accept_rx,
            plain_rx,
            stack,
            driver,
        }
    }

    /// Accept the next multipath connection.
    pub fn accept(&self) -> Result<MetaSocket> {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            self.driver.drive();
            if let Ok(handle) = self.accept_rx.try_recv() {
                return Ok(MetaSocket::new(
                    handle,
                    self.stack.clone(),
                    Arc::clone(&self.driver),
                ));
            }
            if Instant::now() >= deadline {
                return Err(MptcpError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Accept a peer that completed the handshake without multipath.
    pub fn accept_plain(&self) -> Result<PlainEndpoint> {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            self.driver.drive();
            if let Ok(peer) = self.plain_rx.try_recv() {
                return Ok(peer);
            }
            if Instant::now() >= deadline {
                return Err(MptcpError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
