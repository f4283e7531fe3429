//! Content hashes and chain identities.
//!
//! Cache keys are built from these: a `ContentHash` names the bytes fed into
//! a stage, a `ChainId` names the sequence of stages still to run on them.

use std::fmt;
use xxhash_rust::xxh3::{xxh3_128, Xxh3};

/// XXH3-128 hash of a byte string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(u128);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        ContentHash(xxh3_128(data))
    }

    /// The 8 leading hex digits, as used in output file names.
    pub fn short(&self) -> String {
        format!("{:032x}", self.0)[..8].to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}..)", self.short())
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Identity of an ordered list of stage ids.
/// Two chains share an identity exactly when they run the same stages in the
/// same order; the separator keeps ["ab", "c"] apart from ["a", "bc"].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ChainId(u64);

impl ChainId {
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Xxh3::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update(&[UNIT_SEPARATOR]);
        }
        ChainId(hasher.digest())
    }
}
