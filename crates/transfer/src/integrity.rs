use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` and returns the lowercase hex digest.
///
/// This is the digest announced in `chunk-metadata` and checked by the
/// receiver before a sub-chunk counts as received.
pub fn digest_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest_hex(b"hello world"), digest_hex(b"hello world"));
    }

    #[test]
    fn digest_is_64_hex_chars() {
        let d = digest_hex(b"payload");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, d.to_lowercase());
    }

    #[test]
    fn known_vectors() {
        assert_eq!(
            digest_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_data_different_digest() {
        assert_ne!(digest_hex(b"a"), digest_hex(b"b"));
    }
}
