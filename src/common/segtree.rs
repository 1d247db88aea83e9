//! Thread-safe segment tree of non-overlapping write extents.
//!
//! Segments added later logically overwrite older ones: the overlapped
//! portion of an existing segment is displaced and its surviving head/tail
//! parts are re-inserted with their log pointer shifted by the byte delta.
//! Clients use one tree per (client, fid) to coalesce writes before fsync,
//! so the records handed to the delegator carry no intra-batch overlaps.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard};

use crate::utils::StagefsError;

/// One coalesced extent: inclusive byte range `[start, end]` of a file whose
/// data lives at log offset `ptr`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub ptr: u64,
}

#[derive(Debug, Clone, Copy)]
struct SegNode {
    end: u64,
    ptr: u64,
}

#[derive(Debug, Default)]
struct TreeInner {
    /// Nodes keyed by start offset; intervals never overlap, so start order
    /// is also end order.
    nodes: BTreeMap<u64, SegNode>,
    /// Largest `end` ever added (not lowered by overwrites).
    max: u64,
}

/// Segment tree guarded by one reader-writer lock. Mutators take the write
/// lock internally; `read()` hands out a guard so bulk iteration and lookup
/// run without re-acquiring the lock per node.
#[derive(Debug, Default)]
pub struct SegTree {
    inner: RwLock<TreeInner>,
}

impl SegTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        SegTree {
            inner: RwLock::new(TreeInner::default()),
        }
    }

    /// Inserts `[start, end] -> ptr`, displacing the overlapped portions of
    /// any existing segments. Residual head/tail parts of a split segment
    /// keep their pointer shifted by the distance from their old start.
    pub fn add(
        &self,
        start: u64,
        end: u64,
        ptr: u64,
    ) -> Result<(), StagefsError> {
        if start > end {
            return Err(StagefsError(format!(
                "invalid segment [{}, {}]",
                start, end
            )));
        }

        let mut inner = self.inner.write().unwrap();

        // collect segments intersecting [start, end]; walking starts from
        // the greatest start <= end and stops at the first segment ending
        // before our start (non-overlap makes ends ordered too)
        let mut overlaps: Vec<(u64, SegNode)> = vec![];
        for (&s, node) in
            inner.nodes.range((Bound::Unbounded, Bound::Included(end))).rev()
        {
            if node.end < start {
                break;
            }
            overlaps.push((s, *node));
        }

        for (old_start, old) in overlaps {
            inner.nodes.remove(&old_start);
            if old_start < start {
                // head survives
                inner.nodes.insert(
                    old_start,
                    SegNode {
                        end: start - 1,
                        ptr: old.ptr,
                    },
                );
            }
            if old.end > end {
                // tail survives with pointer advanced past the overwritten
                // prefix
                inner.nodes.insert(
                    end + 1,
                    SegNode {
                        end: old.end,
                        ptr: old.ptr + (end + 1 - old_start),
                    },
                );
            }
        }

        inner.nodes.insert(start, SegNode { end, ptr });
        inner.max = inner.max.max(end);
        Ok(())
    }

    /// Removes all segments, resetting `count` and `max`.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.clear();
        inner.max = 0;
    }

    /// Number of segments currently in the tree. Takes the write lock to
    /// serialize with in-flight mutators.
    pub fn count(&self) -> usize {
        self.inner.write().unwrap().nodes.len()
    }

    /// Largest end offset ever added. Takes the write lock to serialize
    /// with in-flight mutators.
    pub fn max(&self) -> u64 {
        self.inner.write().unwrap().max
    }

    /// Acquires the read lock for lookup and iteration; the lock is held
    /// for the lifetime of the returned guard.
    pub fn read(&self) -> SegTreeReadGuard<'_> {
        SegTreeReadGuard {
            inner: self.inner.read().unwrap(),
        }
    }
}

/// Read guard over a segment tree; all lookups through one guard observe a
/// single consistent snapshot.
pub struct SegTreeReadGuard<'a> {
    inner: RwLockReadGuard<'a, TreeInner>,
}

impl SegTreeReadGuard<'_> {
    /// Returns the segment with the smallest start intersecting
    /// `[start, end]`, or `None`. The segment covering `start` (if any)
    /// wins; otherwise the not-less search result is checked against `end`.
    pub fn find(&self, start: u64, end: u64) -> Option<Segment> {
        if let Some((&s, node)) = self
            .inner
            .nodes
            .range((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            if node.end >= start {
                return Some(Segment {
                    start: s,
                    end: node.end,
                    ptr: node.ptr,
                });
            }
        }
        self.inner
            .nodes
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
            .filter(|(&s, _)| s <= end)
            .map(|(&s, node)| Segment {
                start: s,
                end: node.end,
                ptr: node.ptr,
            })
    }

    /// In-order traversal of all segments.
    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        self.inner.nodes.iter().map(|(&start, node)| Segment {
            start,
            end: node.end,
            ptr: node.ptr,
        })
    }
}

#[cfg(test)]
mod segtree_tests {
    use super::*;

    fn segments(tree: &SegTree) -> Vec<Segment> {
        tree.read().iter().collect()
    }

    fn seg(start: u64, end: u64, ptr: u64) -> Segment {
        Segment { start, end, ptr }
    }

    #[test]
    fn coalesce_on_write() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 9, 100)?;
        tree.add(10, 19, 200)?;
        tree.add(5, 14, 500)?;
        assert_eq!(
            segments(&tree),
            vec![seg(0, 4, 100), seg(5, 14, 500), seg(15, 19, 205)]
        );
        assert_eq!(tree.count(), 3);
        assert_eq!(tree.max(), 19);
        Ok(())
    }

    #[test]
    fn full_overwrite() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 99, 1000)?;
        tree.add(0, 99, 2000)?;
        assert_eq!(segments(&tree), vec![seg(0, 99, 2000)]);
        assert_eq!(tree.count(), 1);
        Ok(())
    }

    #[test]
    fn new_contains_old() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(10, 20, 77)?;
        tree.add(0, 50, 500)?;
        assert_eq!(segments(&tree), vec![seg(0, 50, 500)]);
        Ok(())
    }

    #[test]
    fn new_inside_old_splits_both_ways() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 99, 1000)?;
        tree.add(40, 59, 7)?;
        assert_eq!(
            segments(&tree),
            vec![seg(0, 39, 1000), seg(40, 59, 7), seg(60, 99, 1060)]
        );
        Ok(())
    }

    #[test]
    fn adjacency_is_not_overlap() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 9, 1)?;
        tree.add(10, 19, 2)?;
        assert_eq!(tree.count(), 2);
        assert_eq!(segments(&tree), vec![seg(0, 9, 1), seg(10, 19, 2)]);
        Ok(())
    }

    #[test]
    fn single_byte_segment() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 0, 3)?;
        assert_eq!(segments(&tree), vec![seg(0, 0, 3)]);
        Ok(())
    }

    #[test]
    fn inverted_range_rejected() {
        let tree = SegTree::new();
        assert!(tree.add(5, 4, 0).is_err());
        assert_eq!(tree.count(), 0);
    }

    #[test]
    fn add_is_idempotent() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(3, 17, 42)?;
        let once = segments(&tree);
        tree.add(3, 17, 42)?;
        assert_eq!(segments(&tree), once);
        Ok(())
    }

    #[test]
    fn clear_then_replay_is_deterministic() -> Result<(), StagefsError> {
        let adds = [(0u64, 9u64, 100u64), (10, 19, 200), (5, 14, 500)];
        let tree = SegTree::new();
        for &(s, e, p) in &adds {
            tree.add(s, e, p)?;
        }
        let first = segments(&tree);
        tree.clear();
        assert_eq!(tree.count(), 0);
        assert_eq!(tree.max(), 0);
        for &(s, e, p) in &adds {
            tree.add(s, e, p)?;
        }
        assert_eq!(segments(&tree), first);
        Ok(())
    }

    #[test]
    fn find_prefers_lowest_start() -> Result<(), StagefsError> {
        let tree = SegTree::new();
        tree.add(0, 9, 1)?;
        tree.add(20, 29, 2)?;
        tree.add(40, 49, 3)?;
        let guard = tree.read();
        // covering segment wins
        assert_eq!(guard.find(5, 45), Some(seg(0, 9, 1)));
        // not-less search when start falls in a hole
        assert_eq!(guard.find(10, 45), Some(seg(20, 29, 2)));
        // hole past every segment
        assert_eq!(guard.find(50, 60), None);
        // hole between segments, end before the next start
        assert_eq!(guard.find(10, 19), None);
        Ok(())
    }

    #[test]
    fn non_overlap_invariant_random() -> Result<(), StagefsError> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(618);
        let tree = SegTree::new();
        for _ in 0..500 {
            let start = rng.gen_range(0u64..1000);
            let end = start + rng.gen_range(0u64..100);
            tree.add(start, end, start * 10)?;

            let guard = tree.read();
            let segs: Vec<Segment> = guard.iter().collect();
            for pair in segs.windows(2) {
                assert!(
                    pair[0].end < pair[1].start,
                    "overlapping segments {:?} and {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
        Ok(())
    }

    #[test]
    fn coverage_matches_inputs() -> Result<(), StagefsError> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let tree = SegTree::new();
        let mut covered = vec![false; 2048];
        for _ in 0..200 {
            let start = rng.gen_range(0u64..2000);
            let end = (start + rng.gen_range(0u64..48)).min(2047);
            tree.add(start, end, 0)?;
            for b in start..=end {
                covered[b as usize] = true;
            }
        }
        let mut from_tree = vec![false; 2048];
        for s in tree.read().iter() {
            for b in s.start..=s.end {
                from_tree[b as usize] = true;
            }
        }
        assert_eq!(covered, from_tree);
        Ok(())
    }

    #[test]
    fn split_pointer_consistency() -> Result<(), StagefsError> {
        // overwrite bytes [100, 199] of a segment starting at 50 with
        // pointer 5000; the tail must point at 5000 + (200 - 50)
        let tree = SegTree::new();
        tree.add(50, 299, 5000)?;
        tree.add(100, 199, 9000)?;
        assert_eq!(
            segments(&tree),
            vec![seg(50, 99, 5000), seg(100, 199, 9000), seg(200, 299, 5150)]
        );
        Ok(())
    }
}
