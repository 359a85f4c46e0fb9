//! Binmap — a sorted set of disjoint chunk runs.
//!
//! Tracks which chunks a side of a swarm holds. The engine both emits and
//! consumes range HAVEs, so the set stays compact for long-running swarms
//! instead of growing one bit per chunk.

use std::collections::BTreeMap;

use crate::bin::ChunkRange;

/// Compact HAVE set: contiguous runs keyed by start index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binmap {
    // start -> end, runs disjoint and non-adjacent
    runs: BTreeMap<u32, u32>,
}

impl Binmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of chunks in the set.
    pub fn coverage(&self) -> u64 {
        self.runs
            .iter()
            .map(|(&s, &e)| ChunkRange::new(s, e).count())
            .sum()
    }

    pub fn contains(&self, chunk: u32) -> bool {
        self.runs
            .range(..=chunk)
            .next_back()
            .is_some_and(|(_, &e)| chunk <= e)
    }

    /// True if every chunk of `range` is present.
    pub fn contains_range(&self, range: &ChunkRange) -> bool {
        self.runs
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &e)| range.end <= e)
    }

    /// Insert a run, merging with any overlapping or adjacent runs.
    pub fn insert(&mut self, range: ChunkRange) {
        let mut start = range.start;
        let mut end = range.end;

        // Merge a run that ends just before or overlaps our start.
        if let Some((&s, &e)) = self.runs.range(..=start).next_back() {
            if e >= start.saturating_sub(1) {
                start = s;
                end = end.max(e);
                self.runs.remove(&s);
            }
        }
        // Swallow runs starting inside or adjacent to our end.
        loop {
            let Some((&s, &e)) = self.runs.range(start..).next() else {
                break;
            };
            if u64::from(s) > u64::from(end) + 1 {
                break;
            }
            end = end.max(e);
            self.runs.remove(&s);
        }
        self.runs.insert(start, end);
    }

    /// Remove every chunk of `range` from the set.
    pub fn remove(&mut self, range: ChunkRange) {
        // A run strictly left of the range may protrude into it.
        if let Some((&s, &e)) = self.runs.range(..range.start).next_back() {
            if e >= range.start {
                self.runs.insert(s, range.start - 1);
                if e > range.end {
                    self.runs.insert(range.end + 1, e);
                }
            }
        }
        loop {
            let Some((&s, &e)) = self.runs.range(range.start..).next() else {
                break;
            };
            if s > range.end {
                break;
            }
            self.runs.remove(&s);
            if e > range.end {
                self.runs.insert(range.end + 1, e);
                break;
            }
        }
    }

    /// Iterate the contiguous runs in ascending order.
    pub fn runs(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.runs.iter().map(|(&s, &e)| ChunkRange::new(s, e))
    }

    /// Length of the complete prefix: the first chunk index not in the set.
    pub fn filled_prefix(&self) -> u32 {
        match self.runs.first_key_value() {
            Some((&0, &e)) => e.saturating_add(1),
            _ => 0,
        }
    }

    /// Lowest chunk present in the set at or after `from`, if any.
    pub fn first_at_or_after(&self, from: u32) -> Option<u32> {
        if let Some((_, &e)) = self.runs.range(..=from).next_back() {
            if from <= e {
                return Some(from);
            }
        }
        self.runs.range(from..).next().map(|(&s, _)| s)
    }

    /// Lowest chunk at or after `from` present here but absent from `other`.
    pub fn first_missing_from(&self, other: &Binmap, from: u32) -> Option<u32> {
        let mut probe = from;
        loop {
            let candidate = self.first_at_or_after(probe)?;
            if !other.contains(candidate) {
                return Some(candidate);
            }
            // Skip past the other side's run containing the candidate.
            let (_, &e) = other.runs.range(..=candidate).next_back()?;
            probe = e.checked_add(1)?;
        }
    }
}
