//! Random one-time codes and their at-rest digests.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// `bytes` random bytes, hex encoded.
pub fn generate_code(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// SHA-256 hex digest used to store reset, confirmation and exchange codes.
/// Codes are high-entropy, so a fast unsalted digest is enough to look them
/// up by value without keeping the code itself.
pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_hex_of_requested_length() {
        let code = generate_code(32);
        assert_eq!(code.len(), 64);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(code, generate_code(32));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_code("abc"), hash_code("abc"));
        assert_ne!(hash_code("abc"), hash_code("abd"));
    }
}
