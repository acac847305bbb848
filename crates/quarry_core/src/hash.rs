use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh3::Xxh3;

/// Quarry derives identifiers for requests and captured option values with
/// this hasher.
///
/// Speed matters less than stability here: these hashes key the persisted
/// request graph, so the same input must hash identically across runs,
/// machines and platforms.
pub type IdentifierHasher = Xxh3;

pub fn hash_string(s: String) -> String {
  hash_bytes(s.as_bytes())
}

pub fn hash_bytes(s: &[u8]) -> String {
  let res = xxh3_64(s);
  format!("{:016x}", res)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hashes_are_stable_hex_identifiers() {
    let first = hash_string(String::from("env:NODE_ENV"));
    let second = hash_string(String::from("env:NODE_ENV"));

    assert_eq!(first, second);
    assert_eq!(first.len(), 16);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn different_inputs_hash_differently() {
    assert_ne!(
      hash_bytes("option:mode".as_bytes()),
      hash_bytes("option:entries".as_bytes())
    );
  }
}
