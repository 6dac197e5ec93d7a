//! Reassembler: orders packages, pops the gap-free prefix, reports holes.
//!
//! Packages ("cards") are kept as disjoint ranges in a map keyed by start.
//! `cursor` is the next sequence number expected in order.

use std::collections::BTreeMap;

use tracing::trace;

use crate::package::{Package, Seq};
use crate::report::Gap;

pub struct Reassembler {
    cards: BTreeMap<Seq, Package>,
    cursor: Seq,
    /// Holes already handed out by `collect_lost`, as disjoint runs
    /// keyed by start.
    reported: BTreeMap<Seq, Seq>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            cards: BTreeMap::new(),
            cursor: 1,
            reported: BTreeMap::new(),
        }
    }

    pub fn cursor(&self) -> Seq {
        self.cursor
    }

    /// Insert a package. Stale packages are ignored; overlapping cards are
    /// trimmed or split so the incoming package owns its whole range.
    pub fn insert(&mut self, mut package: Package) {
        self.unmark(package.start, package.end);
        if package.end < self.cursor {
            trace!(start = package.start, end = package.end, "stale package");
            return;
        }
        if package.start < self.cursor {
            package.start = self.cursor;
        }
        let overlapping: Vec<Seq> = self
            .cards
            .range(..=package.end)
            .rev()
            .take_while(|(_, card)| card.end >= package.start)
            .map(|(start, _)| *start)
            .collect();
        for start in overlapping {
            let Some(card) = self.cards.remove(&start) else {
                continue;
            };
            if card.start < package.start {
                let piece = card.trimmed(card.start, package.start.saturating_sub(1));
                self.cards.insert(piece.start, piece);
            }
            if card.end > package.end {
                let piece = card.trimmed(package.end.saturating_add(1), card.end);
                self.cards.insert(piece.start, piece);
            }
        }
        self.cards.insert(package.start, package);
    }

    /// Pop the contiguous run starting at `cursor`. Fillers advance the
    /// cursor but are not returned.
    pub fn collect(&mut self) -> Vec<Package> {
        let mut out = Vec::new();
        while let Some(entry) = self.cards.first_entry() {
            if *entry.key() != self.cursor {
                break;
            }
            let card = entry.remove();
            self.cursor = card.end.saturating_add(1);
            if !card.is_filler() {
                out.push(card);
            }
        }
        out
    }

    /// Holes not reported before; marks them reported.
    pub fn collect_lost(&mut self) -> Vec<Gap> {
        let mut fresh = Vec::new();
        for gap in self.gaps() {
            let mut next = gap.start;
            for (&start, &end) in self.reported_within(gap.start, gap.end) {
                if start > next {
                    fresh.push(Gap::new(next, start - 1));
                }
                next = next.max(end.saturating_add(1));
            }
            if next <= gap.end {
                fresh.push(Gap::new(next, gap.end));
            }
            self.mark(gap.start, gap.end);
        }
        fresh
    }

    /// Forget that these gaps were reported so they are requested again.
    pub fn return_lost(&mut self, gaps: &[Gap]) {
        for gap in gaps {
            self.unmark(gap.start, gap.end);
        }
    }

    /// Every hole between the cursor and the last held card.
    pub fn gaps(&self) -> Vec<Gap> {
        let mut out = Vec::new();
        let mut next = self.cursor;
        for card in self.cards.values() {
            if card.start > next {
                out.push(Gap::new(next, card.start - 1));
            }
            next = card.end.saturating_add(1);
        }
        out
    }

    /// Nothing held out of order.
    pub fn is_done(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn held(&self) -> usize {
        self.cards.len()
    }

    /// Reported runs overlapping `lo..=hi`, in order.
    fn reported_within(&self, lo: Seq, hi: Seq) -> impl Iterator<Item = (&Seq, &Seq)> {
        let first = self
            .reported
            .range(..lo)
            .next_back()
            .filter(|(_, end)| **end >= lo);
        first.into_iter().chain(self.reported.range(lo..=hi))
    }

    /// Record `lo..=hi` as reported, merging touching runs.
    fn mark(&mut self, mut lo: Seq, mut hi: Seq) {
        let touching: Vec<(Seq, Seq)> = self
            .reported_within(lo.saturating_sub(1), hi.saturating_add(1))
            .map(|(s, e)| (*s, *e))
            .collect();
        for (start, end) in touching {
            self.reported.remove(&start);
            lo = lo.min(start);
            hi = hi.max(end);
        }
        self.reported.insert(lo, hi);
    }

    /// Forget `lo..=hi`, keeping the parts of runs outside it.
    fn unmark(&mut self, lo: Seq, hi: Seq) {
        if lo > hi {
            return;
        }
        let overlapping: Vec<(Seq, Seq)> = self
            .reported_within(lo, hi)
            .map(|(s, e)| (*s, *e))
            .collect();
        for (start, end) in overlapping {
            self.reported.remove(&start);
            if start < lo {
                self.reported.insert(start, lo - 1);
            }
            if end > hi {
                self.reported.insert(hi + 1, end);
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    fn call(seq: Seq) -> Package {
        Package::call(seq, format!("a{seq}"), Value::Null)
    }

    fn ends(ps: &[Package]) -> Vec<Seq> {
        ps.iter().map(|p| p.end).collect()
    }

    #[test]
    fn out_of_order_then_prefix() {
        let mut r = Reassembler::new();
        r.insert(call(1));
        assert_eq!(ends(&r.collect()), vec![1]);
        r.insert(call(3));
        assert!(r.collect().is_empty());
        r.insert(call(2));
        assert_eq!(ends(&r.collect()), vec![2, 3]);
        assert_eq!(r.cursor(), 4);
        assert!(r.is_done());
    }

    #[test]
    fn scenario_one_three_two() {
        let mut r = Reassembler::new();
        let mut collected = Vec::new();
        for seq in [1, 3, 2] {
            r.insert(call(seq));
            collected.push(ends(&r.collect()));
        }
        // The in-order package pops immediately; the rest wait for 2.
        assert_eq!(collected, vec![vec![1], vec![], vec![2, 3]]);
        assert_eq!(r.cursor(), 4);
    }

    #[test]
    fn scenario_all_held_until_head() {
        let mut r = Reassembler::new();
        r.insert(call(3));
        r.insert(call(2));
        assert!(r.collect().is_empty());
        r.insert(call(1));
        assert_eq!(ends(&r.collect()), vec![1, 2, 3]);
        assert_eq!(r.cursor(), 4);
    }

    #[test]
    fn fillers_advance_cursor_silently() {
        let mut r = Reassembler::new();
        r.insert(Package::filler(1, 4));
        r.insert(call(5));
        assert_eq!(ends(&r.collect()), vec![5]);
        assert_eq!(r.cursor(), 6);
    }

    #[test]
    fn stale_and_duplicate_are_ignored() {
        let mut r = Reassembler::new();
        r.insert(call(1));
        r.collect();
        r.insert(call(1));
        assert!(r.collect().is_empty());
        r.insert(call(3));
        r.insert(call(3));
        assert_eq!(r.held(), 1);
    }

    #[test]
    fn incoming_splits_filler() {
        let mut r = Reassembler::new();
        r.insert(Package::filler(2, 8));
        r.insert(call(5));
        assert_eq!(r.held(), 3);
        r.insert(call(1));
        assert_eq!(ends(&r.collect()), vec![1, 5]);
        assert_eq!(r.cursor(), 9);
    }

    #[test]
    fn partially_stale_filler_is_clipped() {
        let mut r = Reassembler::new();
        r.insert(call(1));
        r.insert(call(2));
        r.collect();
        r.insert(Package::filler(1, 4));
        r.insert(call(5));
        assert_eq!(ends(&r.collect()), vec![5]);
    }

    #[test]
    fn lost_reported_once() {
        let mut r = Reassembler::new();
        r.insert(call(1));
        r.insert(call(4));
        r.collect();
        assert_eq!(r.collect_lost(), vec![Gap::new(2, 3)]);
        assert!(r.collect_lost().is_empty());
        r.insert(call(2));
        // 2 is filled, 3 was already reported.
        assert!(r.collect_lost().is_empty());
        assert_eq!(r.gaps(), vec![Gap::single(3)]);
    }

    #[test]
    fn returned_lost_is_reported_again() {
        let mut r = Reassembler::new();
        r.insert(call(5));
        let lost = r.collect_lost();
        assert_eq!(lost, vec![Gap::new(1, 4)]);
        r.insert(call(2));
        r.return_lost(&lost);
        assert_eq!(r.collect_lost(), vec![Gap::single(1), Gap::new(3, 4)]);
    }

    #[test]
    fn new_holes_reported_beside_old() {
        let mut r = Reassembler::new();
        r.insert(call(3));
        assert_eq!(r.collect_lost(), vec![Gap::new(1, 2)]);
        r.insert(call(7));
        assert_eq!(r.collect_lost(), vec![Gap::new(4, 6)]);
    }

    #[test]
    fn huge_gap_is_one_run() {
        let mut r = Reassembler::new();
        r.insert(call(20_000_001));
        let started = std::time::Instant::now();
        let lost = r.collect_lost();
        assert_eq!(lost, vec![Gap::new(1, 20_000_000)]);
        assert!(r.collect_lost().is_empty());
        r.return_lost(&lost);
        assert_eq!(r.collect_lost(), lost);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(r.reported.len(), 1);
    }

    #[test]
    fn partial_fill_splits_reported_run() {
        let mut r = Reassembler::new();
        r.insert(call(10));
        assert_eq!(r.collect_lost(), vec![Gap::new(1, 9)]);
        r.insert(call(5));
        r.return_lost(&[Gap::new(1, 2)]);
        // 3..=4 and 6..=9 stay reported.
        assert_eq!(r.collect_lost(), vec![Gap::new(1, 2)]);
        r.return_lost(&[Gap::new(4, 7)]);
        assert_eq!(r.collect_lost(), vec![Gap::single(4), Gap::new(6, 7)]);
    }

    #[test]
    fn last_sequence_number_does_not_overflow() {
        let mut r = Reassembler::new();
        r.insert(call(Seq::MAX));
        assert_eq!(r.gaps(), vec![Gap::new(1, Seq::MAX - 1)]);
        assert_eq!(r.collect_lost(), vec![Gap::new(1, Seq::MAX - 1)]);
        r.insert(Package::filler(1, Seq::MAX - 1));
        assert_eq!(ends(&r.collect()), vec![Seq::MAX]);
        assert!(r.gaps().is_empty());
    }

    proptest! {
        #[test]
        fn delivers_every_seq_once_in_order(
            order in Just((1..=40u64).collect::<Vec<_>>()).prop_shuffle(),
            dups in proptest::collection::vec(1..=40u64, 0..20),
        ) {
            let mut r = Reassembler::new();
            let mut delivered = Vec::new();
            for seq in order.iter().chain(dups.iter()) {
                r.insert(call(*seq));
                for p in r.collect() {
                    prop_assert!(p.start >= 1);
                    delivered.push(p.end);
                }
            }
            prop_assert_eq!(delivered, (1..=40u64).collect::<Vec<_>>());
            prop_assert_eq!(r.cursor(), 41);
            prop_assert!(r.is_done());
        }

        #[test]
        fn mixed_fillers_and_overlaps(
            cuts in proptest::collection::btree_set(2..60u64, 0..15),
            shuffle_seed in any::<u64>(),
            extra in proptest::collection::vec((1..60u64, 0..5u64), 0..10),
        ) {
            // Partition 1..=60 into runs; odd runs become fillers.
            let mut bounds: Vec<u64> = vec![1];
            bounds.extend(cuts.iter().copied());
            bounds.push(61);
            let mut packages = Vec::new();
            for (i, w) in bounds.windows(2).enumerate() {
                let (start, end) = (w[0], w[1] - 1);
                if i % 2 == 1 {
                    packages.push(Package::filler(start, end));
                } else {
                    for seq in start..=end {
                        packages.push(call(seq));
                    }
                }
            }
            let expected: Vec<Seq> = packages
                .iter()
                .filter(|p| !p.is_filler())
                .map(|p| p.end)
                .collect();
            let n = packages.len();
            for i in 0..n {
                let j = (shuffle_seed.wrapping_mul(i as u64 + 7) % n as u64) as usize;
                packages.swap(i, j);
            }
            for (start, len) in extra {
                packages.push(Package::filler(start, start + len));
            }
            let mut r = Reassembler::new();
            let mut delivered = Vec::new();
            for p in packages {
                r.insert(p);
                delivered.extend(r.collect().into_iter().map(|p| p.end));
            }
            for w in delivered.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
            for seq in &delivered {
                prop_assert!(expected.contains(seq) || *seq <= 60);
            }
            prop_assert!(r.cursor() >= 61);
        }

        #[test]
        fn insertion_is_idempotent(seqs in proptest::collection::vec(1..30u64, 1..20)) {
            let mut once = Reassembler::new();
            let mut twice = Reassembler::new();
            let mut a = Vec::new();
            let mut b = Vec::new();
            for seq in &seqs {
                once.insert(call(*seq));
                twice.insert(call(*seq));
                twice.insert(call(*seq));
                a.push((ends(&once.collect()), once.collect_lost()));
                b.push((ends(&twice.collect()), twice.collect_lost()));
            }
            prop_assert_eq!(a, b);
        }
    }
}
