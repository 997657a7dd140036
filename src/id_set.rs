use crate::id::{ClientID, Clock, ID};
use std::collections::HashMap;

/// A single contiguous, half-open range `[clock, clock+len)` of deleted clocks on one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub clock: Clock,
    pub len: Clock,
}

impl IdRange {
    #[inline]
    pub fn end(&self) -> Clock {
        self.clock + self.len
    }

    #[inline]
    pub fn contains(&self, clock: Clock) -> bool {
        clock >= self.clock && clock < self.end()
    }

    /// True if `other` starts exactly where `self` ends, so the two ranges can collapse into one.
    #[inline]
    fn adjacent(&self, other: &IdRange) -> bool {
        self.end() == other.clock
    }
}

/// A compact, per-client set of deleted clock ranges (spec.md §4.1 `DeleteSet`).
///
/// Ranges are kept sorted and non-overlapping only after [DeleteSet::sort_and_merge] has run;
/// callers that `insert` during a transaction may append out of order and must merge before
/// relying on ordering (the cleanup pipeline does this once per transaction, see
/// [crate::transaction::TransactionMut]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    clients: HashMap<ClientID, Vec<IdRange>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        DeleteSet {
            clients: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(|v| v.is_empty())
    }

    /// Marks `len` consecutive clocks starting at `id` as deleted.
    pub fn insert(&mut self, id: ID, len: Clock) {
        if len == 0 {
            return;
        }
        let ranges = self.clients.entry(id.client).or_default();
        if let Some(last) = ranges.last_mut() {
            if last.end() == id.clock {
                last.len += len;
                return;
            }
        }
        ranges.push(IdRange {
            clock: id.clock,
            len,
        });
    }

    pub fn contains(&self, id: &ID) -> bool {
        match self.clients.get(&id.client) {
            Some(ranges) => ranges.iter().any(|r| r.contains(id.clock)),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientID, &Vec<IdRange>)> {
        self.clients.iter()
    }

    /// Sorts each client's ranges ascending by clock and collapses adjacent/overlapping ranges.
    /// Idempotent (spec.md §8 P3): running it twice in a row is a no-op the second time.
    pub fn sort_and_merge(&mut self) {
        for ranges in self.clients.values_mut() {
            if ranges.len() <= 1 {
                continue;
            }
            ranges.sort_by_key(|r| r.clock);
            let mut merged: Vec<IdRange> = Vec::with_capacity(ranges.len());
            for range in ranges.drain(..) {
                if let Some(last) = merged.last_mut() {
                    if last.adjacent(&range) || last.contains(range.clock) {
                        let new_end = last.end().max(range.end());
                        last.len = new_end - last.clock;
                        continue;
                    }
                }
                merged.push(range);
            }
            *ranges = merged;
        }
    }

    /// Merges `other` into `self`, then re-sorts affected clients. Used when combining the
    /// delete sets of two transactions (e.g. a pending update and a freshly decoded one).
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.clients {
            let entry = self.clients.entry(client).or_default();
            entry.extend(ranges);
        }
        self.sort_and_merge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_and_merge_collapses_adjacent_ranges() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 10), 5); // [10,15)
        ds.insert(ID::new(1, 0), 5); // [0,5)
        ds.insert(ID::new(1, 5), 5); // [5,10) -> should join both neighbors
        ds.sort_and_merge();

        let ranges = ds.clients.get(&1).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], IdRange { clock: 0, len: 15 });
    }

    #[test]
    fn sort_and_merge_is_idempotent() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(7, 0), 3);
        ds.insert(ID::new(7, 10), 2);
        ds.sort_and_merge();
        let once = ds.clone();
        ds.sort_and_merge();
        assert_eq!(once, ds);
    }

    #[test]
    fn contains_checks_half_open_range() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 4), 3); // [4,7)
        assert!(!ds.contains(&ID::new(1, 3)));
        assert!(ds.contains(&ID::new(1, 4)));
        assert!(ds.contains(&ID::new(1, 6)));
        assert!(!ds.contains(&ID::new(1, 7)));
    }
}
