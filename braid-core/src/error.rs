/// Braid Error Types
///
/// Error kinds for all multipath engine operations.
use thiserror::Error;

/// Main error type for multipath operations
#[derive(Error, Debug)]
pub enum MptcpError {
    /// An MPTCP option with an impossible length; logged and skipped
    #[error("malformed {kind} option (length {len})")]
    OptionMalformed { kind: &'static str, len: usize },

    /// DSS checksum failure; the carrying subflow is reset
    #[error("DSS checksum mismatch on path {path_index}")]
    ChecksumMismatch { path_index: u8 },

    /// Subflow bytes landed outside the current mapping window
    #[error("bytes outside the subflow mapping window")]
    MappingViolation,

    /// JOIN referenced a token with no connection behind it
    #[error("no connection for token {token:#010x}")]
    TokenUnknown { token: u32 },

    /// Two connections raced onto the same token
    #[error("token {token:#010x} already registered")]
    TokenCollision { token: u32 },

    /// Address inventory cap reached
    #[error("address set full ({cap} entries)")]
    AddressSetFull { cap: usize },

    /// Receive backlog full while deferring segment processing
    #[error("receive backlog full, segment dropped")]
    BackpressureDrop,

    /// The peer never negotiated multipath; revert to plain TCP
    #[error("peer is not multipath capable")]
    FallbackRequired,

    /// The underlying subflow was reset
    #[error("subflow {path_index} reset")]
    SubflowReset { path_index: u8 },

    /// JOIN handshake authentication failed
    #[error("join authentication failed")]
    JoinAuthFailed,

    /// Operation on a socket with no established connection
    #[error("not connected")]
    NotConnected,

    /// The meta-connection is closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Non-blocking operation could not complete
    #[error("operation would block")]
    WouldBlock,

    /// Blocking operation timed out
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias for multipath operations
pub type Result<T> = std::result::Result<T, MptcpError>;

impl MptcpError {
    /// Errors that end the whole meta-connection, not just one subflow.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MappingViolation | Self::TokenCollision { .. })
    }

    /// Errors the engine absorbs without dropping the connection.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OptionMalformed { .. }
                | Self::AddressSetFull { .. }
                | Self::BackpressureDrop
                | Self::WouldBlock
                | Self::Timeout
        )
    }

    /// Errors that take down a single subflow.
    #[must_use]
    pub const fn is_subflow_error(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::SubflowReset { .. } | Self::JoinAuthFailed
        )
    }
}
