//! Payload digests recorded with each transfer so the companion can reconcile.

use sha2::{Digest, Sha256};

/// SHA-256 of a payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Lowercase hex form of [`hash_payload`].
pub fn hex_digest(payload: &[u8]) -> String {
    hash_payload(payload)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_digest() {
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_changes_with_content() {
        assert_ne!(hash_payload(b"capture-a"), hash_payload(b"capture-b"));
        assert_eq!(hex_digest(b"abc").len(), 64);
    }
}
