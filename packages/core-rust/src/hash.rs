//! FNV-1a hashing for partition routing.
//!
//! Keys are hashed over their UTF-8 bytes. For ASCII keys the result is
//! identical to hashing UTF-16 code units, so partition ids stay stable for
//! the common case of ASCII map keys.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over raw bytes.
///
/// # Examples
///
/// ```
/// use relaygrid_core::hash::fnv1a_bytes;
///
/// assert_eq!(fnv1a_bytes(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a_bytes(b""), 2_166_136_261);
/// ```
#[must_use]
pub fn fnv1a_bytes(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Computes a 32-bit FNV-1a hash of a string key.
#[must_use]
pub fn fnv1a_hash(key: &str) -> u32 {
    fnv1a_bytes(key.as_bytes())
}
