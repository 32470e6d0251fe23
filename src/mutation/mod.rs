//! # Mutation model
//!
//! A mutation is an atomic set of changes to one partition: an optional
//! partition tombstone, range tombstones over clustering ranges, row markers,
//! and per-column cells. Every piece of data carries a logical timestamp and
//! reconciliation between two writes of the same cell follows one total order,
//! so merging is associative and replicas converge regardless of arrival order.

use crate::err::Error;
use crate::partitioner::DecoratedKey;
use crate::types::{DeletionTime, Timestamp, TtlSeconds};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Seconds since the epoch, as used for deletion and expiry times.
pub fn now_seconds() -> DeletionTime {
    Utc::now().timestamp() as DeletionTime
}

/// One typed clustering component. The derived order is the type-specific
/// total order used for row ordering and clustering-range checks; a schema
/// keeps every component position homogeneously typed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusteringValue {
    Int(i32),
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ClusteringValue {
    fn size_in_bytes(&self) -> usize {
        match self {
            ClusteringValue::Int(_) => 4,
            ClusteringValue::BigInt(_) => 8,
            ClusteringValue::Text(s) => s.len(),
            ClusteringValue::Bytes(b) => b.len(),
        }
    }
}

/// Tuple of clustering components ordering rows within a partition.
pub type ClusteringKey = Vec<ClusteringValue>;

/// A deletion marker. Shadows anything with a timestamp not above its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: Timestamp,

    /// Wall-clock seconds of the deletion, compared as unsigned
    pub deletion_time: DeletionTime,
}

impl Tombstone {
    pub fn new(timestamp: Timestamp, deletion_time: DeletionTime) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    /// Whether data written at `timestamp` is invisible under this tombstone.
    pub fn shadows(&self, timestamp: Timestamp) -> bool {
        timestamp <= self.timestamp
    }

    fn rank(&self) -> (Timestamp, DeletionTime) {
        (self.timestamp, self.deletion_time)
    }

    /// The stronger of two optional tombstones.
    pub fn merge(a: Option<Tombstone>, b: Option<Tombstone>) -> Option<Tombstone> {
        match (a, b) {
            (Some(x), Some(y)) => Some(if x.rank() >= y.rank() { x } else { y }),
            (x, y) => x.or(y),
        }
    }
}

/// One bound of a clustering range; the prefix covers every longer tuple
/// sharing it when inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteringBound {
    pub prefix: ClusteringKey,
    pub inclusive: bool,
}

/// A range over clustering keys. `None` on either side means unbounded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteringRange {
    pub start: Option<ClusteringBound>,
    pub end: Option<ClusteringBound>,
}

fn cmp_prefix(key: &[ClusteringValue], prefix: &[ClusteringValue]) -> Ordering {
    let shared = key.len().min(prefix.len());
    for i in 0..shared {
        match key[i].cmp(&prefix[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    // A key extending the bound prefix counts as equal to it.
    Ordering::Equal
}

impl ClusteringRange {
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// A range holding exactly one clustering key.
    pub fn singular(key: ClusteringKey) -> Self {
        Self {
            start: Some(ClusteringBound {
                prefix: key.clone(),
                inclusive: true,
            }),
            end: Some(ClusteringBound {
                prefix: key,
                inclusive: true,
            }),
        }
    }

    pub fn contains(&self, key: &ClusteringKey) -> bool {
        let after_start = match &self.start {
            None => true,
            Some(b) => match cmp_prefix(key, &b.prefix) {
                Ordering::Greater => true,
                Ordering::Equal => b.inclusive,
                Ordering::Less => false,
            },
        };
        let before_end = match &self.end {
            None => true,
            Some(b) => match cmp_prefix(key, &b.prefix) {
                Ordering::Less => true,
                Ordering::Equal => b.inclusive,
                Ordering::Greater => false,
            },
        };
        after_start && before_end
    }
}

/// A tombstone covering a clustering range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub range: ClusteringRange,
    pub tombstone: Tombstone,
}

/// A single column value, live or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Live {
        timestamp: Timestamp,
        value: Vec<u8>,
        ttl: Option<TtlSeconds>,
        expiry: Option<DeletionTime>,
    },
    Dead {
        timestamp: Timestamp,
        deletion_time: DeletionTime,
    },
}

impl Cell {
    pub fn live(timestamp: Timestamp, value: Vec<u8>) -> Self {
        Cell::Live {
            timestamp,
            value,
            ttl: None,
            expiry: None,
        }
    }

    pub fn live_with_ttl(
        timestamp: Timestamp,
        value: Vec<u8>,
        ttl: TtlSeconds,
        expiry: DeletionTime,
    ) -> Self {
        Cell::Live {
            timestamp,
            value,
            ttl: Some(ttl),
            expiry: Some(expiry),
        }
    }

    pub fn dead(timestamp: Timestamp, deletion_time: DeletionTime) -> Self {
        Cell::Dead {
            timestamp,
            deletion_time,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Cell::Live { timestamp, .. } | Cell::Dead { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Cell::Live { .. })
    }

    /// Whether a live cell is still unexpired at `now`.
    pub fn is_live_at(&self, now: DeletionTime) -> bool {
        match self {
            Cell::Live { expiry, .. } => expiry.map_or(true, |e| e > now),
            Cell::Dead { .. } => false,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Cell::Live { value, .. } => Some(value),
            Cell::Dead { .. } => None,
        }
    }

    /// The total reconciliation order: higher timestamp wins; at equal
    /// timestamp deleted beats live; two live cells compare by value bytes
    /// then by earlier expiry; two deleted cells by larger deletion time.
    fn reconcile_ord(&self, other: &Cell) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| match (self, other) {
                (Cell::Dead { .. }, Cell::Live { .. }) => Ordering::Greater,
                (Cell::Live { .. }, Cell::Dead { .. }) => Ordering::Less,
                (
                    Cell::Live {
                        value: va,
                        expiry: ea,
                        ..
                    },
                    Cell::Live {
                        value: vb,
                        expiry: eb,
                        ..
                    },
                ) => va.cmp(vb).then_with(|| {
                    let ra = Reverse(ea.unwrap_or(DeletionTime::MAX));
                    let rb = Reverse(eb.unwrap_or(DeletionTime::MAX));
                    ra.cmp(&rb)
                }),
                (
                    Cell::Dead {
                        deletion_time: da, ..
                    },
                    Cell::Dead {
                        deletion_time: db, ..
                    },
                ) => da.cmp(db),
            })
    }

    /// Returns the winning cell of the two.
    pub fn reconcile(self, other: Cell) -> Cell {
        if self.reconcile_ord(&other) == Ordering::Less {
            other
        } else {
            self
        }
    }

    fn size_in_bytes(&self) -> usize {
        match self {
            Cell::Live { value, .. } => value.len() + 17,
            Cell::Dead { .. } => 12,
        }
    }
}

/// One row: an optional liveness marker, an optional row tombstone, and
/// per-column cells.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub marker: Option<Timestamp>,
    pub tombstone: Option<Tombstone>,
    pub cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn apply(&mut self, other: &Row) {
        self.marker = match (self.marker, other.marker) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.tombstone = Tombstone::merge(self.tombstone, other.tombstone);
        for (column, cell) in &other.cells {
            match self.cells.remove(column) {
                Some(existing) => {
                    self.cells
                        .insert(column.clone(), existing.reconcile(cell.clone()));
                }
                None => {
                    self.cells.insert(column.clone(), cell.clone());
                }
            }
        }
    }

    pub fn max_timestamp(&self) -> Option<Timestamp> {
        let cells = self.cells.values().map(Cell::timestamp).max();
        let tomb = self.tombstone.map(|t| t.timestamp);
        [self.marker, cells, tomb].into_iter().flatten().max()
    }

    fn min_timestamp(&self) -> Option<Timestamp> {
        let cells = self.cells.values().map(Cell::timestamp).min();
        let tomb = self.tombstone.map(|t| t.timestamp);
        [self.marker, cells, tomb].into_iter().flatten().min()
    }

    fn size_in_bytes(&self) -> usize {
        self.cells
            .iter()
            .map(|(name, cell)| name.len() + cell.size_in_bytes())
            .sum::<usize>()
            + 16
    }
}

/// All changes applied to one partition, merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub tombstone: Option<Tombstone>,
    pub range_tombstones: Vec<RangeTombstone>,
    pub rows: BTreeMap<ClusteringKey, Row>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges another partition's changes into this one.
    pub fn apply(&mut self, other: &Partition) {
        self.tombstone = Tombstone::merge(self.tombstone, other.tombstone);
        for rt in &other.range_tombstones {
            if !self.range_tombstones.contains(rt) {
                self.range_tombstones.push(rt.clone());
            }
        }
        for (ck, row) in &other.rows {
            self.rows.entry(ck.clone()).or_default().apply(row);
        }
    }

    /// Structurally empty: no rows and no deletion markers at all.
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none() && self.range_tombstones.is_empty() && self.rows.is_empty()
    }

    /// The strongest tombstone covering a clustering key, not counting the
    /// row's own tombstone.
    pub fn effective_tombstone(&self, ck: &ClusteringKey) -> Option<Tombstone> {
        let mut tomb = self.tombstone;
        for rt in &self.range_tombstones {
            if rt.range.contains(ck) {
                tomb = Tombstone::merge(tomb, Some(rt.tombstone));
            }
        }
        tomb
    }

    fn covering_tombstone(&self, ck: &ClusteringKey, row: &Row) -> Option<Tombstone> {
        Tombstone::merge(self.effective_tombstone(ck), row.tombstone)
    }

    /// A copy of the row with shadowed and expired cells removed, or `None`
    /// if nothing in the row is visible at `now`.
    pub fn live_row(&self, ck: &ClusteringKey, now: DeletionTime) -> Option<Row> {
        let row = self.rows.get(ck)?;
        let tomb = self.covering_tombstone(ck, row);
        let visible = |ts: Timestamp| tomb.map_or(true, |t| !t.shadows(ts));
        let cells: BTreeMap<String, Cell> = row
            .cells
            .iter()
            .filter(|(_, cell)| visible(cell.timestamp()) && cell.is_live_at(now))
            .map(|(name, cell)| (name.clone(), cell.clone()))
            .collect();
        let marker = row.marker.filter(|ts| visible(*ts));
        if cells.is_empty() && marker.is_none() {
            return None;
        }
        Some(Row {
            marker,
            tombstone: None,
            cells,
        })
    }

    /// Every visible row at `now`, in clustering order.
    pub fn live_rows(&self, now: DeletionTime) -> Vec<(ClusteringKey, Row)> {
        self.rows
            .keys()
            .filter_map(|ck| self.live_row(ck, now).map(|row| (ck.clone(), row)))
            .collect()
    }

    /// The visible value of one cell.
    pub fn live_cell(&self, ck: &ClusteringKey, column: &str, now: DeletionTime) -> Option<Cell> {
        self.live_row(ck, now)?.cells.get(column).cloned()
    }

    /// Whether a read of this partition observes any data at `now`.
    pub fn is_empty_at(&self, now: DeletionTime) -> bool {
        self.rows.keys().all(|ck| self.live_row(ck, now).is_none())
    }

    /// Drops cells shadowed by tombstones or expired, and optionally the
    /// tombstones themselves once they are past the grace period. Used by
    /// compaction; the read path never compacts in place.
    pub fn compact(&mut self, now: DeletionTime, gc_before: Option<DeletionTime>) {
        let partition_level = self.tombstone;
        let ranges = self.range_tombstones.clone();
        self.rows.retain(|ck, row| {
            let mut tomb = partition_level;
            for rt in &ranges {
                if rt.range.contains(ck) {
                    tomb = Tombstone::merge(tomb, Some(rt.tombstone));
                }
            }
            tomb = Tombstone::merge(tomb, row.tombstone);
            row.cells.retain(|_, cell| {
                let shadowed = tomb.map_or(false, |t| t.shadows(cell.timestamp()));
                if shadowed {
                    return false;
                }
                match cell {
                    Cell::Live { expiry, .. } => expiry.map_or(true, |e| e > now),
                    // A dead cell is itself a tombstone; purge only past grace.
                    Cell::Dead { deletion_time, .. } => {
                        gc_before.map_or(true, |cutoff| *deletion_time >= cutoff)
                    }
                }
            });
            if let (Some(ts), Some(t)) = (row.marker, tomb) {
                if t.shadows(ts) {
                    row.marker = None;
                }
            }
            if let Some(cutoff) = gc_before {
                if row.tombstone.map_or(false, |t| t.deletion_time < cutoff) {
                    row.tombstone = None;
                }
            }
            !row.cells.is_empty() || row.marker.is_some() || row.tombstone.is_some()
        });
        if let Some(cutoff) = gc_before {
            self.range_tombstones
                .retain(|rt| rt.tombstone.deletion_time >= cutoff);
            if self.tombstone.map_or(false, |t| t.deletion_time < cutoff) {
                self.tombstone = None;
            }
        }
    }

    pub fn max_timestamp(&self) -> Timestamp {
        let rows = self.rows.values().filter_map(Row::max_timestamp).max();
        let ranges = self.range_tombstones.iter().map(|rt| rt.tombstone.timestamp).max();
        let tomb = self.tombstone.map(|t| t.timestamp);
        [rows, ranges, tomb]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    pub fn min_timestamp(&self) -> Timestamp {
        let rows = self.rows.values().filter_map(Row::min_timestamp).min();
        let ranges = self.range_tombstones.iter().map(|rt| rt.tombstone.timestamp).min();
        let tomb = self.tombstone.map(|t| t.timestamp);
        [rows, ranges, tomb]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(Timestamp::MAX)
    }

    /// Deletion times of every tombstone held, for the drop-time histogram.
    pub fn tombstone_drop_times(&self) -> Vec<DeletionTime> {
        let mut times: Vec<DeletionTime> = Vec::new();
        if let Some(t) = self.tombstone {
            times.push(t.deletion_time);
        }
        times.extend(self.range_tombstones.iter().map(|rt| rt.tombstone.deletion_time));
        for row in self.rows.values() {
            if let Some(t) = row.tombstone {
                times.push(t.deletion_time);
            }
            times.extend(row.cells.values().filter_map(|c| match c {
                Cell::Dead { deletion_time, .. } => Some(*deletion_time),
                Cell::Live { .. } => None,
            }));
        }
        times
    }

    /// Rough in-memory footprint, used for region accounting and the cache
    /// partition size cap.
    pub fn size_in_bytes(&self) -> usize {
        let rows: usize = self
            .rows
            .iter()
            .map(|(ck, row)| {
                ck.iter().map(ClusteringValue::size_in_bytes).sum::<usize>() + row.size_in_bytes()
            })
            .sum();
        rows + self.range_tombstones.len() * 24 + if self.tombstone.is_some() { 12 } else { 0 }
    }
}

/// An atomic set of changes to one partition of one column family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub cf_id: Uuid,
    pub key: DecoratedKey,
    pub partition: Partition,
}

impl Mutation {
    pub fn new(cf_id: Uuid, key: DecoratedKey) -> Self {
        Self {
            cf_id,
            key,
            partition: Partition::new(),
        }
    }

    pub fn set_cell(
        &mut self,
        ck: &[ClusteringValue],
        column: &str,
        value: Vec<u8>,
        timestamp: Timestamp,
    ) {
        self.row(ck)
            .cells
            .insert(column.to_string(), Cell::live(timestamp, value));
    }

    pub fn set_cell_with_ttl(
        &mut self,
        ck: &[ClusteringValue],
        column: &str,
        value: Vec<u8>,
        timestamp: Timestamp,
        ttl: TtlSeconds,
    ) {
        let expiry = now_seconds().saturating_add(ttl);
        self.row(ck).cells.insert(
            column.to_string(),
            Cell::live_with_ttl(timestamp, value, ttl, expiry),
        );
    }

    pub fn delete_cell(
        &mut self,
        ck: &[ClusteringValue],
        column: &str,
        timestamp: Timestamp,
        deletion_time: DeletionTime,
    ) {
        self.row(ck)
            .cells
            .insert(column.to_string(), Cell::dead(timestamp, deletion_time));
    }

    pub fn set_row_marker(&mut self, ck: &[ClusteringValue], timestamp: Timestamp) {
        self.row(ck).marker = Some(timestamp);
    }

    pub fn delete_row(
        &mut self,
        ck: &[ClusteringValue],
        timestamp: Timestamp,
        deletion_time: DeletionTime,
    ) {
        let row = self.row(ck);
        row.tombstone = Tombstone::merge(
            row.tombstone,
            Some(Tombstone::new(timestamp, deletion_time)),
        );
    }

    pub fn delete_partition(&mut self, timestamp: Timestamp, deletion_time: DeletionTime) {
        self.partition.tombstone = Tombstone::merge(
            self.partition.tombstone,
            Some(Tombstone::new(timestamp, deletion_time)),
        );
    }

    pub fn delete_range(
        &mut self,
        range: ClusteringRange,
        timestamp: Timestamp,
        deletion_time: DeletionTime,
    ) {
        self.partition.range_tombstones.push(RangeTombstone {
            range,
            tombstone: Tombstone::new(timestamp, deletion_time),
        });
    }

    fn row(&mut self, ck: &[ClusteringValue]) -> &mut Row {
        self.partition.rows.entry(ck.to_vec()).or_default()
    }

    /// Serializes into the wire shape handed to the commit log and the
    /// streaming transport.
    pub fn freeze(&self) -> Result<FrozenMutation, Error> {
        let bytes = bincode::serialize(self).map_err(|error| Error::EncodeError {
            context: "mutation",
            error,
        })?;
        Ok(FrozenMutation { bytes })
    }
}

/// A serialized mutation, as carried by the commit log and streaming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrozenMutation {
    bytes: Vec<u8>,
}

impl FrozenMutation {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn unfreeze(&self) -> Result<Mutation, Error> {
        bincode::deserialize(&self.bytes).map_err(|error| Error::DecodeError {
            context: "mutation",
            error,
        })
    }

    pub fn representation(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::decorate;

    fn ck(values: &[i64]) -> ClusteringKey {
        values.iter().map(|v| ClusteringValue::BigInt(*v)).collect()
    }

    #[test]
    fn higher_timestamp_wins() {
        let a = Cell::live(10, b"a".to_vec());
        let b = Cell::live(5, b"b".to_vec());
        assert_eq!(a.clone().reconcile(b.clone()), a);
        assert_eq!(b.reconcile(a.clone()), a);
    }

    #[test]
    fn dead_beats_live_at_equal_timestamp() {
        let live = Cell::live(10, b"a".to_vec());
        let dead = Cell::dead(10, 100);
        assert_eq!(live.reconcile(dead.clone()), dead);
    }

    #[test]
    fn live_ties_break_on_value_then_expiry() {
        let small = Cell::live(10, b"aa".to_vec());
        let big = Cell::live(10, b"ab".to_vec());
        assert_eq!(small.reconcile(big.clone()), big);

        let expires_early = Cell::live_with_ttl(10, b"v".to_vec(), 1, 100);
        let expires_late = Cell::live_with_ttl(10, b"v".to_vec(), 1, 200);
        assert_eq!(
            expires_late.reconcile(expires_early.clone()),
            expires_early
        );
    }

    #[test]
    fn dead_ties_break_on_deletion_time() {
        let older = Cell::dead(10, 100);
        let newer = Cell::dead(10, 200);
        assert_eq!(older.reconcile(newer.clone()), newer);
    }

    #[test]
    fn reconcile_is_associative() {
        let cells = [
            Cell::live(10, b"a".to_vec()),
            Cell::dead(10, 50),
            Cell::live(11, b"b".to_vec()),
            Cell::live(11, b"c".to_vec()),
            Cell::dead(12, 7),
        ];
        for a in &cells {
            for b in &cells {
                for c in &cells {
                    let left = a.clone().reconcile(b.clone()).reconcile(c.clone());
                    let right = a.clone().reconcile(b.clone().reconcile(c.clone()));
                    assert_eq!(left, right);
                }
            }
        }
    }

    #[test]
    fn partition_tombstone_shadows_older_rows() {
        let key = decorate(b"p");
        let mut m = Mutation::new(Uuid::new_v4(), key);
        m.set_cell(&ck(&[1]), "v", b"x".to_vec(), 10);
        let mut partition = m.partition.clone();

        partition.apply(&Partition {
            tombstone: Some(Tombstone::new(20, now_seconds())),
            ..Default::default()
        });
        assert!(partition.live_row(&ck(&[1]), now_seconds()).is_none());
        assert!(partition.is_empty_at(now_seconds()));
    }

    #[test]
    fn newer_write_survives_partition_tombstone() {
        let mut partition = Partition::new();
        partition.tombstone = Some(Tombstone::new(20, now_seconds()));
        let mut row = Row::default();
        row.cells.insert("v".into(), Cell::live(30, b"x".to_vec()));
        partition.rows.insert(ck(&[1]), row);

        let live = partition.live_row(&ck(&[1]), now_seconds()).unwrap();
        assert_eq!(live.cells["v"].value(), Some(&b"x"[..]));
    }

    #[test]
    fn range_tombstone_covers_contained_rows() {
        let mut partition = Partition::new();
        let mut row = Row::default();
        row.cells.insert("v".into(), Cell::live(100, b"x".to_vec()));
        partition.rows.insert(ck(&[5, 10]), row);

        // Unbounded range tombstone at a higher timestamp, as streamed by a
        // repair: the row must disappear.
        partition.range_tombstones.push(RangeTombstone {
            range: ClusteringRange::full(),
            tombstone: Tombstone::new(200, now_seconds()),
        });
        assert!(partition.live_row(&ck(&[5, 10]), now_seconds()).is_none());
    }

    #[test]
    fn bounded_range_tombstone_spares_outside_rows() {
        let mut partition = Partition::new();
        for c in [1, 5, 9] {
            let mut row = Row::default();
            row.cells.insert("v".into(), Cell::live(100, vec![c as u8]));
            partition.rows.insert(ck(&[c]), row);
        }
        partition.range_tombstones.push(RangeTombstone {
            range: ClusteringRange {
                start: Some(ClusteringBound {
                    prefix: ck(&[2]),
                    inclusive: true,
                }),
                end: Some(ClusteringBound {
                    prefix: ck(&[6]),
                    inclusive: true,
                }),
            },
            tombstone: Tombstone::new(200, now_seconds()),
        });
        let now = now_seconds();
        assert!(partition.live_row(&ck(&[1]), now).is_some());
        assert!(partition.live_row(&ck(&[5]), now).is_none());
        assert!(partition.live_row(&ck(&[9]), now).is_some());
    }

    #[test]
    fn compact_purges_expired_tombstones_only_past_grace() {
        let now = now_seconds();
        let mut partition = Partition::new();
        let mut row = Row::default();
        row.cells.insert("v".into(), Cell::dead(10, now - 100));
        partition.rows.insert(ck(&[1]), row);

        let mut recent = partition.clone();
        recent.compact(now, Some(now - 1000));
        assert!(!recent.rows.is_empty());

        let mut aged = partition;
        aged.compact(now, Some(now));
        assert!(aged.rows.is_empty());
    }

    #[test]
    fn freeze_roundtrip() {
        let mut m = Mutation::new(Uuid::new_v4(), decorate(b"p"));
        m.set_cell(&ck(&[1, 2]), "status", b"online".to_vec(), 42);
        m.delete_row(&ck(&[3]), 50, now_seconds());
        let frozen = m.freeze().unwrap();
        assert_eq!(frozen.unfreeze().unwrap(), m);
        assert!(frozen.size() > 0);
    }
}
