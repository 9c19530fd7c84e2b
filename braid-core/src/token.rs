//! Process-wide token registry.
//!
//! Maps a 32-bit connection token to its control block so a JOIN SYN can
//! find the meta-connection it belongs to. The registry is generic over
//! the handle type; the protocol crate stores `Arc<Mutex<Mpcb>>` here and
//! the clone returned by [`TokenRegistry::find`] is what keeps the
//! connection alive across the lookup.

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::{MptcpError, Result};

/// Registry of live connection tokens.
///
/// A reader-writer lock protects the map: lookups on the packet path are
/// shared, registration and teardown are exclusive.
#[derive(Debug, Default)]
pub struct TokenRegistry<T> {
    map: RwLock<HashMap<u32, T>>,
}

impl<T: Clone> TokenRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handle` under `token`.
    ///
    /// # Errors
    ///
    /// `TokenCollision` when the token is already taken; the caller must
    /// pick a different token, never overwrite.
    pub fn insert(&self, token: u32, handle: T) -> Result<()> {
        let mut map = self.map.write();
        if map.contains_key(&token) {
            warn!(token, "token collision on registry insert");
            return Err(MptcpError::TokenCollision { token });
        }
        map.insert(token, handle);
        Ok(())
    }

    /// Look up a token, cloning the handle out under the read lock.
    #[must_use]
    pub fn find(&self, token: u32) -> Option<T> {
        self.map.read().get(&token).cloned()
    }

    /// Remove a token. Idempotent.
    pub fn remove(&self, token: u32) -> Option<T> {
        self.map.write().remove(&token)
    }

    #[must_use]
    pub fn contains(&self, token: u32) -> bool {
        self.map.read().contains_key(&token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let reg: TokenRegistry<&'static str> = TokenRegistry::new();
        reg.insert(0xdead_beef, "conn").unwrap();
        assert_eq!(reg.find(0xdead_beef), Some("conn"));
        assert!(reg.find(0xfeed_face).is_none());
        assert_eq!(reg.remove(0xdead_beef), Some("conn"));
        assert!(reg.remove(0xdead_beef).is_none());
    }

    #[test]
    fn collision_is_an_error() {
        let reg: TokenRegistry<u8> = TokenRegistry::new();
        reg.insert(7, 1).unwrap();
        assert!(matches!(
            reg.insert(7, 2),
            Err(MptcpError::TokenCollision { token: 7 })
        ));
        // The original registration survives.
        assert_eq!(reg.find(7), Some(1));
    }
}
