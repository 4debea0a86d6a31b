//! Deterministic entity identity.
//!
//! Peers that have never exchanged a numeric View id still agree on the
//! entity's hierarchical path ("Level/Doors/Front"). The identity is a hash
//! of that path truncated to 32 bits, so collisions are possible and
//! accepted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Path-derived correlation key for one logical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityIdentity(pub u32);

impl EntityIdentity {
    /// Hashes a sequence of path segments.
    ///
    /// Empty segments are skipped, so `["a", "", "b"]` and `["a", "b"]`
    /// produce the same identity.
    pub fn from_segments<I, P>(segments: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        let mut first = true;
        for segment in segments {
            let segment = segment.as_ref();
            if segment.is_empty() {
                continue;
            }
            if !first {
                hasher.update(b"/");
            }
            hasher.update(segment.as_bytes());
            first = false;
        }
        let digest = hasher.finalize();
        Self(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Hashes a `/`-separated path.
    pub fn from_path(path: &str) -> Self {
        Self::from_segments(path.split('/'))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
