//! # Braid
//!
//! A Multipath TCP engine: several concurrent subflows — each a full
//! TCP connection between a pair of endpoint addresses — aggregated
//! into a single, in-order, reliable byte stream.
//!
//! ## Architecture
//!
//! Braid is structured as a **protocol kernel** with clean layering:
//!
//! - **`braid-core`**: sequence arithmetic, segment buffers, global
//!   registries, configuration, errors
//! - **`braid-mptcp`**: pure sans-IO state machines (option codec, DSN
//!   mapping, reassembly, path manager, scheduler, the connection block)
//! - **`braid`**: public API surface (this crate)
//!
//! The per-subflow TCP machine and all OS glue stay outside, consumed
//! through the [`SubflowTransport`] contract. The bundled loopback
//! fabric is the reference embedding and what the integration tests
//! run on.
//!
//! ## Quick Start
//!
//! ```rust
//! use braid::{LoopbackNet, MetaSocket, MptcpConfig, MptcpStack};
//! use std::sync::Arc;
//!
//! let net = LoopbackNet::new();
//! let server = MptcpStack::new(MptcpConfig::default());
//! let client = MptcpStack::new(MptcpConfig::default());
//!
//! let listener = net.bind(&server, "10.0.0.1:80".parse().unwrap());
//! let handle = net
//!     .connect(&client, "10.0.1.1:9000".parse().unwrap(), "10.0.0.1:80".parse().unwrap())
//!     .unwrap();
//! let sock = MetaSocket::new(handle, client, Arc::new(net));
//! let peer = listener.accept().unwrap();
//!
//! sock.send(b"over any path").unwrap();
//! let mut buf = [0u8; 32];
//! let n = peer.recv(&mut buf).unwrap();
//! assert_eq!(&buf[..n], b"over any path");
//! ```

pub mod dev_tracing;
pub mod loopback;
pub mod socket;

pub use braid_core::config::MptcpConfig;
pub use braid_core::error::{MptcpError, Result};
pub use braid_core::monitor::{ConnEvent, ConnMonitor};
pub use braid_mptcp::mpcb::{MetaState, Mpcb, MpcbAction};
pub use braid_mptcp::path::LinkEvent;
pub use braid_mptcp::stack::{JoinOutcome, MpcbHandle, MptcpStack};
pub use braid_mptcp::subflow::{SubflowTransport, TcpInfo, TcpState, WireSegment};
pub use loopback::{LinkId, LoopbackNet, PlainEndpoint};
pub use socket::{Driver, MetaListener, MetaSocket};
