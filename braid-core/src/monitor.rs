//! Connection event monitoring.
//!
//! Provides event streams for tracking meta-connection lifecycle events
//! like subflow establishment, path failure, and fallback.

use std::fmt;
use std::net::SocketAddr;

/// Meta-connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// A subflow finished its handshake and joined the connection.
    SubflowEstablished {
        token: u32,
        path_index: u8,
        local: SocketAddr,
        remote: SocketAddr,
    },

    /// A subflow was detached.
    SubflowClosed { token: u32, path_index: u8 },

    /// A subflow was marked potentially failed.
    SubflowPotentiallyFailed { token: u32, path_index: u8 },

    /// The peer advertised a new address.
    AddressAdded {
        token: u32,
        addr_id: u8,
        addr: SocketAddr,
    },

    /// The peer withdrew an address.
    AddressRemoved { token: u32, addr_id: u8 },

    /// The connection reverted to plain TCP.
    FallbackToTcp { token: u32 },

    /// The meta-connection is fully closed.
    Closed { token: u32 },
}

impl fmt::Display for ConnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubflowEstablished {
                token,
                path_index,
                local,
                remote,
            } => write!(
                f,
                "Subflow {path_index} established on {token:#010x}: {local} -> {remote}"
            ),
            Self::SubflowClosed { token, path_index } => {
                write!(f, "Subflow {path_index} closed on {token:#010x}")
            }
            Self::SubflowPotentiallyFailed { token, path_index } => {
                write!(f, "Subflow {path_index} potentially failed on {token:#010x}")
            }
            Self::AddressAdded {
                token,
                addr_id,
                addr,
            } => write!(f, "Address {addr} (id {addr_id}) added on {token:#010x}"),
            Self::AddressRemoved { token, addr_id } => {
                write!(f, "Address id {addr_id} removed on {token:#010x}")
            }
            Self::FallbackToTcp { token } => write!(f, "Fallback to TCP on {token:#010x}"),
            Self::Closed { token } => write!(f, "Connection {token:#010x} closed"),
        }
    }
}

/// Handle for receiving connection events.
pub type ConnMonitor = flume::Receiver<ConnEvent>;

/// Internal sender for connection events.
///
/// Exposed publicly so engine components can emit events.
pub type ConnEventSender = flume::Sender<ConnEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ConnEventSender, ConnMonitor) {
    flume::unbounded()
}
