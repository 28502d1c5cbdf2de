//! Sparse byte-range sets.
//!
//! Backing store for the per-message bookkeeping: which byte ranges of
//! an outbound message still need sending, which have been acknowledged,
//! and which parts of an inbound message have arrived. Ranges are
//! half-open `[start, end)` and kept coalesced.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseRanges {
    spans: BTreeMap<u32, u32>,
}

impl SparseRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total bytes covered.
    pub fn covered(&self) -> u64 {
        self.spans.iter().map(|(&s, &e)| u64::from(e - s)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.spans.iter().map(|(&s, &e)| (s, e))
    }

    /// Insert `[start, end)`, merging with overlapping or adjacent spans.
    pub fn insert(&mut self, mut start: u32, mut end: u32) {
        if start >= end {
            return;
        }
        if let Some((&s, &e)) = self.spans.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.spans.remove(&s);
            }
        }
        let absorbed: Vec<u32> = self.spans.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            let e = self.spans.remove(&s).expect("key just observed");
            end = end.max(e);
        }
        self.spans.insert(start, end);
    }

    /// Remove `[start, end)`, splitting spans as needed.
    pub fn remove(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        if let Some((&s, &e)) = self.spans.range(..start).next_back() {
            if e > start {
                self.spans.insert(s, start);
                if e > end {
                    self.spans.insert(end, e);
                }
            }
        }
        let affected: Vec<u32> = self.spans.range(start..end).map(|(&s, _)| s).collect();
        for s in affected {
            let e = self.spans.remove(&s).expect("key just observed");
            if e > end {
                self.spans.insert(end, e);
            }
        }
    }

    /// Remove everything covered by `other`.
    pub fn subtract(&mut self, other: &SparseRanges) {
        for (s, e) in other.iter() {
            self.remove(s, e);
        }
    }

    /// Does this set cover all of `[start, end)` in one piece?
    pub fn covers(&self, start: u32, end: u32) -> bool {
        if start >= end {
            return true;
        }
        match self.spans.range(..=start).next_back() {
            Some((_, &e)) => e >= end,
            None => false,
        }
    }

    pub fn first(&self) -> Option<(u32, u32)> {
        self.spans.iter().next().map(|(&s, &e)| (s, e))
    }

    /// Detach up to `max_len` bytes from the front of the first span.
    pub fn take_first(&mut self, max_len: u32) -> Option<(u32, u32)> {
        debug_assert!(max_len > 0);
        let (start, end) = self.first()?;
        let take_end = end.min(start + max_len);
        self.remove(start, take_end);
        Some((start, take_end))
    }
}
