//! Random tokens for temporary keys

use rand::{RngExt, rng};

/// Hex encoding of `len` random bytes from the thread-local CSPRNG
///
/// The result is `2 * len` characters long.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}
