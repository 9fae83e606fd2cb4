//! Path key derivation.
//!
//! A path key is the identity of a path inside the map: 16 bytes, where
//! byte 0 is a framing/flag byte (zero in a bare key) and bytes 1..15 hold
//! the first 15 bytes of the SHA-256 of the path. The map stores only
//! keys, never path strings.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length in bytes of a path key, and of every record in the log.
pub const PATHKEY_LEN: usize = 16;

/// 16-byte path key. Byte 0 is reserved for framing and is always zero on
/// a key held in memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pathkey([u8; PATHKEY_LEN]);

impl Pathkey {
    /// Key for a whole path.
    pub fn compute(path: &str, case_insensitive: bool) -> Self {
        let mut h = PathkeyHasher::new(case_insensitive);
        h.update(path);
        h.pathkey()
    }

    pub fn as_bytes(&self) -> &[u8; PATHKEY_LEN] {
        &self.0
    }

    pub(crate) fn from_bytes(bytes: [u8; PATHKEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Pathkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Incremental path key builder.
///
/// Feeding a path piece by piece yields the same key as hashing the
/// concatenation, and the digest state can be sampled at any point, so one
/// left-to-right pass over a path produces the key of every ancestor
/// prefix.
pub struct PathkeyHasher {
    hash: Sha256,
    case_insensitive: bool,
}

impl PathkeyHasher {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            hash: Sha256::new(),
            case_insensitive,
        }
    }

    /// Feed the next piece of the path.
    ///
    /// Case folding applies to exactly the bytes fed per call; callers
    /// must split on segment boundaries, never inside a segment.
    pub fn update(&mut self, s: &str) {
        if self.case_insensitive {
            self.hash.update(s.to_uppercase().as_bytes());
        } else {
            self.hash.update(s.as_bytes());
        }
    }

    /// Key for the bytes fed so far; the hasher stays usable.
    pub fn pathkey(&self) -> Pathkey {
        let sum = self.hash.clone().finalize();
        let mut k = [0u8; PATHKEY_LEN];
        k[1..].copy_from_slice(&sum[..PATHKEY_LEN - 1]);
        Pathkey(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_whole() {
        let mut h = PathkeyHasher::new(false);
        h.update("/");
        h.update("a");
        let prefix = h.pathkey();
        assert_eq!(prefix, Pathkey::compute("/a", false));

        h.update("/");
        h.update("b");
        assert_eq!(h.pathkey(), Pathkey::compute("/a/b", false));
    }

    #[test]
    fn framing_byte_is_zero() {
        let k = Pathkey::compute("/some/path", false);
        assert_eq!(k.as_bytes()[0], 0);
        let k = Pathkey::compute("", false);
        assert_eq!(k.as_bytes()[0], 0);
    }

    #[test]
    fn case_folding() {
        assert_eq!(
            Pathkey::compute("/Foo/BAR", true),
            Pathkey::compute("/foo/bar", true)
        );
        assert_ne!(
            Pathkey::compute("/Foo/BAR", false),
            Pathkey::compute("/foo/bar", false)
        );
        // folded and unfolded maps derive different keys for folded input
        assert_ne!(
            Pathkey::compute("/foo", true),
            Pathkey::compute("/foo", false)
        );
    }

    #[test]
    fn distinct_paths_distinct_keys() {
        assert_ne!(Pathkey::compute("/a", false), Pathkey::compute("/b", false));
        assert_ne!(Pathkey::compute("/a", false), Pathkey::compute("a", false));
    }
}
