//! Content addressing
//!
//! blake3 everywhere. A [`ContentHash`] is the digest of some canonical
//! byte encoding; [`merkle_root`] folds a leaf layer bottom-up, carrying
//! an odd tail leaf straight into the next level unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid content hash: {0}")]
pub struct InvalidHash(pub String);

/// A blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn hash(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Interior Merkle node: hash of the two child digests in order.
    pub fn combine(left: &ContentHash, right: &ContentHash) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&left.0);
        hasher.update(&right.0);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Result<Self, InvalidHash> {
        if hex.len() != 64 {
            return Err(InvalidHash(hex.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| InvalidHash(hex.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| InvalidHash(hex.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHash;

    fn try_from(hex: String) -> Result<Self, Self::Error> {
        Self::from_hex(&hex)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// Root over a leaf layer. The empty layer hashes to the digest of the
/// empty byte string so "no content" still has a stable address.
pub fn merkle_root(leaves: &[ContentHash]) -> ContentHash {
    if leaves.is_empty() {
        return ContentHash::hash(b"");
    }
    let mut level: Vec<ContentHash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(ContentHash::combine(left, right)),
                [odd] => next.push(*odd),
                _ => {}
            }
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_input_sensitive() {
        let a = ContentHash::hash(b"hello");
        assert_eq!(a, ContentHash::hash(b"hello"));
        assert_ne!(a, ContentHash::hash(b"hello!"));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = ContentHash::hash(b"a");
        let b = ContentHash::hash(b"b");
        assert_ne!(ContentHash::combine(&a, &b), ContentHash::combine(&b, &a));
    }

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::hash(b"round trip");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert!(ContentHash::from_hex("zz").is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let hash = ContentHash::hash(b"wire");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn debug_shows_a_short_prefix() {
        let hash = ContentHash::hash(b"dbg");
        let debug = format!("{hash:?}");
        assert!(debug.starts_with("ContentHash("));
        assert_eq!(debug.len(), "ContentHash(".len() + 12 + 1);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = ContentHash::hash(b"only");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn odd_leaf_promotes() {
        let a = ContentHash::hash(b"a");
        let b = ContentHash::hash(b"b");
        let c = ContentHash::hash(b"c");
        let expected = ContentHash::combine(&ContentHash::combine(&a, &b), &c);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn any_leaf_change_moves_the_root() {
        let leaves: Vec<ContentHash> = (0..7u8)
            .map(|i| ContentHash::hash(&[i]))
            .collect();
        let root = merkle_root(&leaves);
        for i in 0..leaves.len() {
            let mut tampered = leaves.clone();
            tampered[i] = ContentHash::hash(b"tampered");
            assert_ne!(merkle_root(&tampered), root, "leaf {i} tamper undetected");
        }
    }

    #[test]
    fn empty_layer_has_a_stable_address() {
        assert_eq!(merkle_root(&[]), ContentHash::hash(b""));
    }
}
