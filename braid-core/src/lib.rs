//! Braid Core
//!
//! This crate contains the runtime-agnostic core building blocks:
//! - Wrapping sequence arithmetic shared by subflow and DSN space (`seq`)
//! - Meta-segment buffers (`segment`)
//! - The segmented meta-receive buffer (`buffer`)
//! - Process-wide token registry (`token`)
//! - Global pending-join table (`join`)
//! - Deferred work queue for interrupt-style call sites (`defer`)
//! - Connection event monitoring (`monitor`)
//! - Configuration knobs (`config`)
//! - Error types (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]
pub mod buffer;
pub mod config;
pub mod defer;
pub mod error;
pub mod join;
pub mod monitor;
pub mod segment;
pub mod seq;
pub mod token;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::config::MptcpConfig;
    pub use crate::defer::{DeferredJob, WorkQueue};
    pub use crate::error::{MptcpError, Result};
    pub use crate::join::{FourTuple, PendingJoin, PendingJoinTable};
    pub use crate::monitor::{create_monitor, ConnEvent, ConnEventSender, ConnMonitor};
    pub use crate::segment::Segment;
    pub use crate::token::TokenRegistry;
}
