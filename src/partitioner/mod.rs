//! # Partitioner
//!
//! Maps a partition key to a token and a shard. Hashing is deterministic and
//! stable across nodes, so every replica derives the same placement for a key.
//! A decorated key carries the token next to the raw key bytes; partitions are
//! ordered by token first, then by key bytes.

use crate::types::Key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Bound;

/// Position of a partition on the token ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

/// Returns the token for a partition key.
pub fn token_of<K: AsRef<[u8]>>(key: K) -> Token {
    Token(seahash::hash(key.as_ref()) as i64)
}

/// Returns the shard responsible for a token.
pub fn shard_of(token: Token, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    // Shift into unsigned space so negative tokens spread over shards too.
    let unsigned = (token.0 as i128 - i64::MIN as i128) as u128;
    (unsigned % shard_count as u128) as usize
}

/// Builds the decorated key for a partition key.
pub fn decorate<K: AsRef<[u8]>>(key: K) -> DecoratedKey {
    DecoratedKey {
        token: token_of(key.as_ref()),
        key: key.as_ref().to_vec(),
    }
}

/// A partition key paired with its token; the ordering key of partitions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Key,
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl DecoratedKey {
    pub fn shard(&self, shard_count: usize) -> usize {
        shard_of(self.token, shard_count)
    }
}

/// A range over decorated keys, as issued by the read path.
#[derive(Clone, Debug)]
pub struct PartitionRange {
    pub start: Bound<DecoratedKey>,
    pub end: Bound<DecoratedKey>,
}

impl PartitionRange {
    /// The full range: every partition.
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// A range holding exactly one partition.
    pub fn singular(key: DecoratedKey) -> Self {
        Self {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    pub fn is_singular(&self) -> bool {
        matches!((&self.start, &self.end), (Bound::Included(s), Bound::Included(e)) if s == e)
    }

    /// The single key of a singular range.
    pub fn singular_key(&self) -> Option<&DecoratedKey> {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) if s == e => Some(s),
            _ => None,
        }
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// Whether any key in `[first, last]` can fall inside this range.
    pub fn overlaps(&self, first: &DecoratedKey, last: &DecoratedKey) -> bool {
        let starts_before_last = match &self.start {
            Bound::Included(s) => s <= last,
            Bound::Excluded(s) => s < last,
            Bound::Unbounded => true,
        };
        let ends_after_first = match &self.end {
            Bound::Included(e) => e >= first,
            Bound::Excluded(e) => e > first,
            Bound::Unbounded => true,
        };
        starts_before_last && ends_after_first
    }
}
