//! Tar block alignment
//!
//! Every header and every data run in a tar stream starts on a 512-byte
//! boundary. All offset arithmetic in the layout engine goes through here.

/// Size of a tar block in bytes
pub const BLOCK_SIZE: u64 = 512;

/// Length of the end-of-archive marker (two zero blocks)
pub const END_OF_ARCHIVE_LEN: u64 = 2 * BLOCK_SIZE;

/// Bytes needed to advance `offset` to the next block boundary
///
/// Returns a value in `[0, 511]`; already aligned offsets need no padding.
pub const fn padding(offset: u64) -> u64 {
    offset.wrapping_neg() & (BLOCK_SIZE - 1)
}

/// Round `offset` up to the next block boundary
pub const fn align_up(offset: u64) -> u64 {
    offset + padding(offset)
}

/// Check if `offset` sits on a block boundary
pub const fn is_aligned(offset: u64) -> bool {
    padding(offset) == 0
}

/// Trailing pad for the manifest entry
///
/// Same as [`padding`], except that a body ending exactly on a boundary gets a
/// full extra block so the manifest is always followed by at least one pad
/// block.
pub const fn manifest_padding(body_len: u64) -> u64 {
    match padding(body_len) {
        0 => BLOCK_SIZE,
        pad => pad,
    }
}
