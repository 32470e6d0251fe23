//! # Sstable filtering for single-key readers
//!
//! Before reading a partition out of candidate sstables the read path prunes
//! them three ways: the bloom filter, a clustering-range check against the
//! per-component min/max metadata, and a tombstone rescue that keeps any
//! pruned sstable still able to shadow a surviving row.

use crate::mutation::{ClusteringRange, ClusteringValue};
use crate::partitioner::DecoratedKey;
use crate::sstable::Sstable;
use std::sync::Arc;

/// The clustering restriction of a read. No ranges means the whole partition.
#[derive(Clone, Debug, Default)]
pub struct QuerySlice {
    pub ranges: Vec<ClusteringRange>,
}

impl QuerySlice {
    pub fn full() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn of(ranges: Vec<ClusteringRange>) -> Self {
        Self { ranges }
    }

    /// A single full range short-circuits every clustering check.
    pub fn is_full(&self) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(ClusteringRange::is_full)
    }
}

/// Range over one clustering component.
#[derive(Clone, Debug)]
struct ComponentRange {
    min: Option<(ClusteringValue, bool)>,
    max: Option<(ClusteringValue, bool)>,
}

/// Splits a clustering range into per-component ranges: leading components
/// where start equals end peel off as singular ranges, the first diverging
/// pair contributes one range with the requester's inclusivity, and trailing
/// components are dropped. A half-open range contributes a single one-sided
/// range.
fn split_per_component(range: &ClusteringRange) -> Vec<ComponentRange> {
    match (&range.start, &range.end) {
        (None, None) => Vec::new(),
        (Some(start), None) => match start.prefix.first() {
            Some(value) => vec![ComponentRange {
                min: Some((value.clone(), start.inclusive)),
                max: None,
            }],
            None => Vec::new(),
        },
        (None, Some(end)) => match end.prefix.first() {
            Some(value) => vec![ComponentRange {
                min: None,
                max: Some((value.clone(), end.inclusive)),
            }],
            None => Vec::new(),
        },
        (Some(start), Some(end)) => {
            let mut out = Vec::new();
            let shared = start.prefix.len().min(end.prefix.len());
            for i in 0..shared {
                if start.prefix[i] == end.prefix[i] {
                    out.push(ComponentRange {
                        min: Some((start.prefix[i].clone(), true)),
                        max: Some((start.prefix[i].clone(), true)),
                    });
                    continue;
                }
                out.push(ComponentRange {
                    min: Some((start.prefix[i].clone(), start.inclusive)),
                    max: Some((end.prefix[i].clone(), end.inclusive)),
                });
                return out;
            }
            // One bound ran out of components: the longer side contributes
            // a one-sided range for the next position.
            if start.prefix.len() > shared {
                out.push(ComponentRange {
                    min: Some((start.prefix[shared].clone(), start.inclusive)),
                    max: None,
                });
            } else if end.prefix.len() > shared {
                out.push(ComponentRange {
                    min: None,
                    max: Some((end.prefix[shared].clone(), end.inclusive)),
                });
            }
            out
        }
    }
}

/// Whether a component range intersects `[stored_min, stored_max]` under the
/// component's total order.
fn component_overlaps(
    range: &ComponentRange,
    stored_min: &ClusteringValue,
    stored_max: &ClusteringValue,
) -> bool {
    if let Some((value, inclusive)) = &range.min {
        let fits = if *inclusive {
            stored_max >= value
        } else {
            stored_max > value
        };
        if !fits {
            return false;
        }
    }
    if let Some((value, inclusive)) = &range.max {
        let fits = if *inclusive {
            stored_min <= value
        } else {
            stored_min < value
        };
        if !fits {
            return false;
        }
    }
    true
}

/// Whether a requested clustering range can intersect the sstable's stored
/// per-component bounds.
fn range_overlaps_sstable(range: &ClusteringRange, sstable: &Sstable) -> bool {
    let meta = sstable.metadata();
    if meta.min_clustering.is_empty() {
        // No clustering rows on record; nothing to prune on.
        return true;
    }
    for (i, component) in split_per_component(range).iter().enumerate() {
        let (stored_min, stored_max) = match (meta.min_clustering.get(i), meta.max_clustering.get(i))
        {
            (Some(min), Some(max)) => (min, max),
            // The sstable never stored this component; unbounded.
            _ => return true,
        };
        if !component_overlaps(component, stored_min, stored_max) {
            return false;
        }
    }
    true
}

/// Filters candidate sstables for a single-partition read: bloom check,
/// clustering-range check, then tombstone rescue. The rescue keeps every
/// pruned sstable whose max timestamp exceeds the smallest min timestamp of
/// the kept set and which holds tombstones, since one of them may shadow a
/// kept live row.
pub fn filter_sstables_for_reader(
    candidates: Vec<Arc<Sstable>>,
    key: &DecoratedKey,
    slice: &QuerySlice,
) -> Vec<Arc<Sstable>> {
    let passing_bloom: Vec<Arc<Sstable>> = candidates
        .into_iter()
        .filter(|sst| sst.may_contain(key))
        .collect();
    if slice.is_full() {
        return passing_bloom;
    }

    let (mut kept, pruned): (Vec<_>, Vec<_>) = passing_bloom
        .into_iter()
        .partition(|sst| slice.ranges.iter().any(|r| range_overlaps_sstable(r, sst)));

    let min_timestamp = kept.iter().map(|sst| sst.min_timestamp()).min();
    if let Some(min_timestamp) = min_timestamp {
        for sst in pruned {
            if sst.max_timestamp() > min_timestamp && sst.metadata().has_tombstones() {
                kept.push(sst);
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{ClusteringBound, Mutation, Partition};
    use crate::partitioner::decorate;
    use crate::sstable::Sstable;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn ck(values: &[i64]) -> Vec<ClusteringValue> {
        values.iter().map(|v| ClusteringValue::BigInt(*v)).collect()
    }

    fn bound(values: &[i64], inclusive: bool) -> Option<ClusteringBound> {
        Some(ClusteringBound {
            prefix: ck(values),
            inclusive,
        })
    }

    fn range(start: &[i64], end: &[i64]) -> ClusteringRange {
        ClusteringRange {
            start: bound(start, true),
            end: bound(end, true),
        }
    }

    async fn sstable_with(
        dir: &std::path::Path,
        generation: u64,
        build: impl FnOnce(&mut Mutation),
    ) -> Arc<Sstable> {
        let mut m = Mutation::new(Uuid::new_v4(), decorate(b"pk"));
        build(&mut m);
        let entries: Vec<(crate::partitioner::DecoratedKey, Partition)> =
            vec![(m.key.clone(), m.partition)];
        Arc::new(
            Sstable::write(dir, "apps", "events", "la", generation, 0, 1, 0.01, entries)
                .await
                .unwrap(),
        )
    }

    #[test]
    fn per_component_split_peels_singular_prefix() {
        let r = ClusteringRange {
            start: bound(&[1, 2, 5], true),
            end: bound(&[1, 2, 9], false),
        };
        let split = split_per_component(&r);
        assert_eq!(split.len(), 3);
        // Two singular components, then the diverging pair with the
        // requester's inclusivity.
        assert_eq!(split[0].min.as_ref().unwrap().0, ClusteringValue::BigInt(1));
        assert!(split[0].min.as_ref().unwrap().1);
        assert_eq!(split[2].min.as_ref().unwrap().1, true);
        assert_eq!(split[2].max.as_ref().unwrap().1, false);
    }

    #[test]
    fn half_open_range_contributes_one_sided_range() {
        let r = ClusteringRange {
            start: bound(&[7], false),
            end: None,
        };
        let split = split_per_component(&r);
        assert_eq!(split.len(), 1);
        assert!(split[0].max.is_none());
        assert!(!split[0].min.as_ref().unwrap().1);
    }

    #[tokio::test]
    async fn disjoint_clustering_range_prunes_sstable() {
        let root = tempdir().unwrap();
        let sst = sstable_with(root.path(), 1, |m| {
            m.set_cell(&ck(&[5, 10]), "v", b"x".to_vec(), 100);
        })
        .await;
        let key = decorate(b"pk");

        let matching = QuerySlice::of(vec![range(&[5, 10], &[5, 10])]);
        assert_eq!(
            filter_sstables_for_reader(vec![Arc::clone(&sst)], &key, &matching).len(),
            1
        );

        let disjoint = QuerySlice::of(vec![range(&[50], &[60])]);
        assert!(filter_sstables_for_reader(vec![sst], &key, &disjoint).is_empty());
    }

    #[tokio::test]
    async fn full_slice_short_circuits() {
        let root = tempdir().unwrap();
        let sst = sstable_with(root.path(), 1, |m| {
            m.set_cell(&ck(&[1]), "v", b"x".to_vec(), 1);
        })
        .await;
        let kept =
            filter_sstables_for_reader(vec![sst], &decorate(b"pk"), &QuerySlice::full());
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn bloom_prunes_before_clustering() {
        let root = tempdir().unwrap();
        let sst = sstable_with(root.path(), 1, |m| {
            m.set_cell(&ck(&[1]), "v", b"x".to_vec(), 1);
        })
        .await;
        // A key the sstable certainly does not contain.
        let kept = filter_sstables_for_reader(
            vec![sst],
            &decorate(b"definitely-absent-key-123456"),
            &QuerySlice::full(),
        );
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn tombstone_bearing_sstable_is_rescued() {
        let root = tempdir().unwrap();
        // Sstable A holds the row the query wants, written at ts 100.
        let a = sstable_with(root.path(), 1, |m| {
            m.set_cell(&ck(&[5, 10]), "v", b"x".to_vec(), 100);
        })
        .await;
        // Sstable B holds only a newer range tombstone over a clustering
        // span outside the queried one.
        let b = sstable_with(root.path(), 2, |m| {
            m.set_cell(&ck(&[900]), "other", b"y".to_vec(), 150);
            m.delete_range(
                ClusteringRange {
                    start: bound(&[0], true),
                    end: None,
                },
                200,
                crate::mutation::now_seconds(),
            );
        })
        .await;

        let slice = QuerySlice::of(vec![range(&[5, 10], &[5, 10])]);
        let kept = filter_sstables_for_reader(vec![a, b], &decorate(b"pk"), &slice);
        // B fails the clustering check but must be rescued: it may shadow
        // the row A supplies.
        assert_eq!(kept.len(), 2);
    }
}
