//! Stable hashing helpers for deriving ids from names.

use blake3::Hasher;

pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut h = Hasher::new();
    h.update(bytes);
    h.finalize().into()
}

/// First eight bytes of the BLAKE3 digest, little-endian.
///
/// Stable across runs and platforms, unlike `std`'s `DefaultHasher`.
pub fn stable_u64(bytes: &[u8]) -> u64 {
    let digest = hash_bytes(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_u64_is_deterministic() {
        assert_eq!(stable_u64(b"StringView"), stable_u64(b"StringView"));
        assert_ne!(stable_u64(b"StringView"), stable_u64(b"ArrayView"));
    }
}
