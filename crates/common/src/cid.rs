//! Content ID helpers based on SHA-256.
//! Files are addressed by the lowercase hex SHA-256 of their bytes.

use sha2::{Digest, Sha256};

/// Length of a hex SHA-256 content id.
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// Compute SHA-256 and return lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let sum = hasher.finalize();
    hex::encode(sum)
}

/// Short prefix form useful for logging (first 12 hex chars).
pub fn short_hash(hash: &str) -> &str {
    hash.get(0..12).unwrap_or(hash)
}

/// True when `hash` looks like a content id: 64 lowercase hex characters.
pub fn is_content_hash(hash: &str) -> bool {
    hash.len() == CONTENT_HASH_HEX_LEN
        && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// True when `data` hashes to `hash`.
pub fn matches_content(hash: &str, data: &[u8]) -> bool {
    sha256_hex(data) == hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = b"some payload bytes";
        let h1 = sha256_hex(a);
        let h2 = sha256_hex(a);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), CONTENT_HASH_HEX_LEN);
        assert!(is_content_hash(&h1));
        assert!(matches_content(&h1, a));
        assert!(!matches_content(&h1, b"other"));
    }

    #[test]
    fn test_is_content_hash_rejects_malformed() {
        assert!(!is_content_hash(""));
        assert!(!is_content_hash("abc"));
        assert!(!is_content_hash(&"A".repeat(64)));
        assert!(!is_content_hash(&"g".repeat(64)));
    }

    #[test]
    fn test_short_hash() {
        let h = sha256_hex(b"x");
        assert_eq!(short_hash(&h).len(), 12);
        assert_eq!(short_hash("abc"), "abc");
    }
}
