//! Compacted sets of unsigned identifiers.
//!
//! Purged and closed transaction ids grow without bound over a client's
//! lifetime, and they arrive almost always in dense runs. Storing them as
//! sorted disjoint inclusive intervals keeps membership and insertion at
//! `O(log n)` in the number of runs instead of the number of ids.

use serde::{Deserialize, Serialize};

/// A set of `u64` values stored as sorted, disjoint, inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of distinct runs (not values) held.
    pub fn run_count(&self) -> usize {
        self.ranges.len()
    }

    /// Whether `value` is a member.
    pub fn contains(&self, value: u64) -> bool {
        match self.ranges.binary_search_by(|&(start, _)| start.cmp(&value)) {
            Ok(_) => true,
            Err(0) => false,
            Err(idx) => self.ranges[idx - 1].1 >= value,
        }
    }

    /// Insert a single value, coalescing with adjacent runs.
    pub fn insert(&mut self, value: u64) {
        self.insert_range(value, value);
    }

    /// Insert the inclusive range `[start, end]`, coalescing overlapping and
    /// adjacent runs.
    pub fn insert_range(&mut self, start: u64, end: u64) {
        assert!(start <= end, "inverted range");

        // First run that could touch [start, end]: its end reaches to at
        // least start - 1 (adjacency coalesces too).
        let low = self
            .ranges
            .partition_point(|&(_, e)| e < start.saturating_sub(1));
        // One past the last run that could touch it.
        let high = self
            .ranges
            .partition_point(|&(s, _)| s <= end.saturating_add(1));

        if low >= high {
            self.ranges.insert(low, (start, end));
            return;
        }

        let merged_start = self.ranges[low].0.min(start);
        let merged_end = self.ranges[high - 1].1.max(end);
        self.ranges.drain(low..high);
        self.ranges.insert(low, (merged_start, merged_end));
    }

    /// Largest member, if any.
    pub fn max(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }

    /// Iterate the runs in ascending order.
    pub fn iter_runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }
}
