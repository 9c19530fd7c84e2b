//! CAPABLE and JOIN handshake material.
//!
//! Key, nonce and initial-sequence-number generation, the key → token
//! derivation both ends compute, and the auth words exchanged on JOIN.
//! The three-way state machines themselves live with their owners: the
//! connection block drives the client side, the stack drives the server
//! side.
//!
//! The auth word is a keyed 64-bit mixing function over both keys and
//! both nonces rather than a real HMAC; both ends compute and verify the
//! same value. Swapping in HMAC-SHA1 touches only [`join_auth_word`] and
//! [`join_auth_digest`].

use rand::Rng;

use crate::codec::MptcpOption;

/// Generate a 64-bit connection key. Never zero, so a zero key can mean
/// "not negotiated yet".
#[must_use]
pub fn generate_key() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let key: u64 = rng.gen();
        if key != 0 {
            return key;
        }
    }
}

/// Generate a subflow initial sequence number.
#[must_use]
pub fn generate_isn() -> u32 {
    rand::thread_rng().gen()
}

/// Generate a JOIN nonce.
#[must_use]
pub fn generate_nonce() -> u32 {
    rand::thread_rng().gen()
}

/// Derive the 32-bit token a peer uses to address the connection keyed
/// by `key`.
///
/// Both ends compute this over the keys exchanged in CAPABLE, so a JOIN
/// initiator knows the receiver's token without it ever appearing on the
/// wire outside the JOIN SYN. Collisions are handled at registration
/// time by regenerating the key.
#[must_use]
pub const fn token_of(key: u64) -> u32 {
    let mixed = mix64(key);
    (mixed >> 32) as u32
}

/// Derive the initial data sequence number for the byte stream keyed by
/// `key`. Each sender starts its DSN space here; the receiver computes
/// the same value from the key learned in CAPABLE.
#[must_use]
pub const fn idsn_of(key: u64) -> u32 {
    mix64(key.rotate_left(29)) as u32
}

/// The truncated auth word sent on a JOIN SYN-ACK.
///
/// Keyed by both connection keys, bound to both nonces; the SYN-ACK
/// sender passes its own key first.
#[must_use]
pub const fn join_auth_word(
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> u64 {
    let nonces = ((local_nonce as u64) << 32) | remote_nonce as u64;
    mix64(mix64(local_key ^ nonces) ^ mix64(remote_key.rotate_left(17) ^ nonces))
}

/// The full 20-byte auth digest sent on the final JOIN ACK.
///
/// Expanded from the same keyed word with the roles reversed (the ACK
/// sender passes its own key first on its side).
#[must_use]
pub fn join_auth_digest(
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> [u8; 20] {
    let seed = join_auth_word(local_key, remote_key, local_nonce, remote_nonce);
    let mut out = [0u8; 20];
    let mut word = seed;
    for chunk in out.chunks_mut(8) {
        word = mix64(word.wrapping_add(0x9e37_79b9_7f4a_7c15));
        chunk.copy_from_slice(&word.to_be_bytes()[..chunk.len()]);
    }
    out
}

/// A 64-bit finalizer with good avalanche behavior.
const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Pick the first CAPABLE option out of a parsed batch.
#[must_use]
pub fn find_capable(opts: &[MptcpOption]) -> Option<&MptcpOption> {
    opts.iter().find(|o| {
        matches!(
            o,
            MptcpOption::CapableSyn { .. }
                | MptcpOption::CapableSynAck { .. }
                | MptcpOption::CapableAck { .. }
        )
    })
}

/// Pick the first JOIN option out of a parsed batch.
///
/// The server-side receive path calls this exactly once per packet and
/// hands the result to both the lookup and the accept path.
#[must_use]
pub fn find_join(opts: &[MptcpOption]) -> Option<&MptcpOption> {
    opts.iter().find(|o| {
        matches!(
            o,
            MptcpOption::JoinSyn { .. } | MptcpOption::JoinSynAck { .. } | MptcpOption::JoinAck { .. }
        )
    })
}
