//! # Braid MPTCP
//!
//! **Internal protocol implementation crate for Braid.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `braid` crate for the public API.**
//!
//! This crate provides the sans-IO multipath engine: pure state machines
//! fed with wire segments per subflow, transmitting through the subflow
//! transport contract. The actual TCP machinery, IO and socket glue live
//! with the embedder.
//!
//! ## Layout
//!
//! - **`codec`**: MPTCP option encode/decode and the DSS checksum
//! - **`handshake`**: keys, tokens, nonces and JOIN authentication
//! - **`mapping`**: subflow-sequence → DSN translation (the cursor)
//! - **`reassembly`**: the meta receive and out-of-order queues
//! - **`path`**: address inventories and the path table
//! - **`scheduler`**: per-segment subflow selection
//! - **`reinject`**: recovery of bytes stranded on failed paths
//! - **`subflow`**: per-path state and the TCP transport contract
//! - **`mpcb`**: the connection control block tying it all together
//! - **`stack`**: token registry, pending-join table, listeners

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]
pub mod codec;
pub mod handshake;
pub mod mapping;
pub mod mpcb;
pub mod path;
pub mod reassembly;
pub mod reinject;
pub mod scheduler;
pub mod stack;
pub mod subflow;

pub mod prelude {
    pub use crate::codec::{Dss, DssMapping, MptcpOption};
    pub use crate::mpcb::{MetaState, Mpcb, MpcbAction};
    pub use crate::path::{AddrEntry, AddressSet, LinkEvent, Path, PathTable};
    pub use crate::stack::{JoinOutcome, Listener, MpcbHandle, MptcpStack};
    pub use crate::subflow::{Subflow, SubflowTransport, TcpInfo, TcpState, WireSegment};
}
