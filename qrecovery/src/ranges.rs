use std::{collections::BTreeMap, ops::Range};

/// A set of disjoint, non-adjacent half open `u64` ranges.
///
/// Used for acknowledged stream bytes, received stream bytes and received
/// packet numbers. Adjacent or overlapping insertions are coalesced, so the
/// number of entries stays proportional to the number of holes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Insert `range`, returning how many of its values were not present yet.
    pub fn insert(&mut self, range: Range<u64>) -> u64 {
        if range.is_empty() {
            return 0;
        }
        let (mut start, mut end) = (range.start, range.end);
        let lower = self
            .0
            .range(..=range.start)
            .next_back()
            .map_or(range.start, |(&s, _)| s);
        let touching: Vec<(u64, u64)> = self
            .0
            .range(lower..=range.end)
            .filter(|&(_, &e)| e >= range.start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut overlap = 0;
        for (s, e) in touching {
            self.0.remove(&s);
            overlap += e.min(range.end).saturating_sub(s.max(range.start));
            start = start.min(s);
            end = end.max(e);
        }
        self.0.insert(start, end);
        (range.end - range.start) - overlap
    }

    /// Remove every value in `range`.
    pub fn remove_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let lower = self
            .0
            .range(..=range.start)
            .next_back()
            .map_or(range.start, |(&s, _)| s);
        let touching: Vec<(u64, u64)> = self
            .0
            .range(lower..range.end)
            .filter(|&(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.0.remove(&s);
            if s < range.start {
                self.0.insert(s, range.start);
            }
            if e > range.end {
                self.0.insert(range.end, e);
            }
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.0
            .range(..=value)
            .next_back()
            .is_some_and(|(_, &e)| value < e)
    }

    /// The end of the range starting at `from`, if one starts exactly there
    /// or covers it; `from` otherwise.
    pub fn contiguous_end(&self, from: u64) -> u64 {
        match self.0.range(..=from).next_back() {
            Some((_, &e)) if e > from => e,
            _ => from,
        }
    }

    pub fn max(&self) -> Option<u64> {
        self.0.last_key_value().map(|(_, &e)| e - 1)
    }

    pub fn min(&self) -> Option<u64> {
        self.0.first_key_value().map(|(&s, _)| s)
    }

    /// Forget every value below `bound`.
    pub fn remove_below(&mut self, bound: u64) {
        let keep = self.0.split_off(&bound);
        let straddling = self
            .0
            .last_key_value()
            .filter(|&(_, &e)| e > bound)
            .map(|(_, &e)| e);
        self.0 = keep;
        if let Some(end) = straddling {
            self.0.insert(bound, end);
        }
    }

    /// Ranges in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.0.iter().map(|(&s, &e)| s..e)
    }

    /// The parts of `range` not in the set, ascending.
    pub fn gaps_in(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return gaps;
        }
        let mut cursor = range.start;
        let first = self.0.range(..=range.start).next_back().map(|(&s, _)| s);
        let lower = first.unwrap_or(range.start);
        for (&s, &e) in self.0.range(lower..range.end) {
            if e <= cursor {
                continue;
            }
            if s > cursor {
                gaps.push(cursor..s);
            }
            cursor = cursor.max(e);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }
}
