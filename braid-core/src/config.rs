//! Engine configuration knobs.
//!
//! The sysctl surface of the original system rendered as a plain struct:
//! build one at subsystem startup and hand it to the stack. Nothing here
//! is hot-reloaded.

use std::time::Duration;

/// Multipath engine configuration.
///
/// # Examples
///
/// ```
/// use braid_core::config::MptcpConfig;
///
/// let cfg = MptcpConfig::default()
///     .with_checksum(true)
///     .with_ndiffports(4);
/// ```
#[derive(Debug, Clone)]
pub struct MptcpConfig {
    /// Master switch. When `false`, every new connection falls back to
    /// plain TCP at SYN time and no multipath state is kept.
    pub enabled: bool,

    /// Port-diversity mode. When `> 1`, the path table is seeded once
    /// with `ndiffports - 1` extra paths over the master address pair
    /// (local port picked by the stack) instead of the address cartesian
    /// product.
    pub ndiffports: u8,

    /// Require the DSS checksum on data mappings.
    pub checksum: bool,

    /// Default maximum segment size for meta-sends, in payload bytes.
    pub mss: u16,

    /// Index into the scheduler table. Out-of-range values select the
    /// default min-RTT scheduler.
    pub scheduler: usize,

    /// How long a pending JOIN may stay half-open. Shares TCP's SYN
    /// timeout in spirit.
    pub join_timeout: Duration,

    /// Initial per-subflow send buffer, in bytes. The meta send buffer is
    /// the sum over subflows.
    pub sndbuf: usize,

    /// Initial per-subflow receive buffer, in bytes.
    pub rcvbuf: usize,
}

impl Default for MptcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ndiffports: 1,
            checksum: false,
            mss: 1400,
            scheduler: 0,
            join_timeout: Duration::from_secs(6),
            sndbuf: 256 * 1024,
            rcvbuf: 256 * 1024,
        }
    }
}

impl MptcpConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_ndiffports(mut self, n: u8) -> Self {
        self.ndiffports = n;
        self
    }

    #[must_use]
    pub const fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    #[must_use]
    pub const fn with_mss(mut self, mss: u16) -> Self {
        self.mss = mss;
        self
    }

    #[must_use]
    pub const fn with_scheduler(mut self, index: usize) -> Self {
        self.scheduler = index;
        self
    }

    #[must_use]
    pub const fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_sndbuf(mut self, bytes: usize) -> Self {
        self.sndbuf = bytes;
        self
    }

    #[must_use]
    pub const fn with_rcvbuf(mut self, bytes: usize) -> Self {
        self.rcvbuf = bytes;
        self
    }

    /// Port-diversity construction is selected.
    #[inline]
    #[must_use]
    pub const fn port_diversity(&self) -> bool {
        self.ndiffports > 1
    }
}
