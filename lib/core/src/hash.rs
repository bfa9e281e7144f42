//! Stable, process-independent hashing.
//!
//! `std::hash::DefaultHasher` is free to change between releases, so anything
//! that must agree across processes (partition routing, node id derivation)
//! goes through this 64-bit FNV-1a instead.

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes `bytes` with 64-bit FNV-1a.
#[must_use]
pub fn stable_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
