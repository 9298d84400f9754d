//! Fingerprint derivation.

use sha2::{Digest, Sha256};

/// Length in characters of every fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

/// Derive the fingerprint of a computation from its defining inputs.
///
/// Lowercase hex SHA-256, so the key is fixed-length and safe to embed in
/// lock resources and object keys.
pub fn derive_hash(content: &str) -> String {
  derive_hash_bytes(content.as_bytes())
}

/// [`derive_hash`] over raw bytes, for inputs that are not valid UTF-8.
pub fn derive_hash_bytes(content: &[u8]) -> String {
  hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_same_input_same_fingerprint() {
    assert_eq!(derive_hash("doc123:v1"), derive_hash("doc123:v1"));
  }

  #[test]
  fn test_different_inputs_differ() {
    assert_ne!(derive_hash("doc123:v1"), derive_hash("doc123:v2"));
    assert_ne!(derive_hash(""), derive_hash(" "));
  }

  #[test]
  fn test_binary_inputs_differ() {
    let a = derive_hash_bytes(&[0x25, 0x50, 0xff]);
    let b = derive_hash_bytes(&[0x25, 0x50, 0xfe]);
    assert_ne!(a, b);
    assert_eq!(a.len(), FINGERPRINT_LEN);
    assert_eq!(derive_hash_bytes(b"abc"), derive_hash("abc"));
  }

  #[test]
  fn test_fixed_length_hex() {
    for content in ["", "x", &"long".repeat(1000)] {
      let hash = derive_hash(content);
      assert_eq!(hash.len(), FINGERPRINT_LEN);
      assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
  }

  #[test]
  fn test_known_digest() {
    assert_eq!(
      derive_hash("abc"),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }
}
