//! Reconstruction state and sequence gap detection.
//!
//! Gaps are computed against the full range `[1, max_seen]` rather than
//! from jumps between consecutive arrivals, so out-of-order delivery and
//! duplicates do not produce phantom or hidden gaps.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{FeedError, Result};
use crate::packet::Packet;

/// Gaps a session chases when nothing else is configured.
pub const DEFAULT_MAX_MISSING: usize = 10_000;

/// Packets received so far, keyed by sequence. Owned by one session.
#[derive(Debug, Default, Clone)]
pub struct ReconstructionState {
    packets: BTreeMap<i32, Packet>,
    max_contiguous: i32,
    max_seen: i32,
}

impl ReconstructionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet, replacing any earlier one with the same sequence.
    /// Returns false for non-positive sequences, which are never stored.
    pub fn insert(&mut self, p: Packet) -> bool {
        let seq = p.sequence;
        if seq <= 0 {
            warn!(sequence = seq, "dropping packet with non-positive sequence");
            return false;
        }
        if self.packets.insert(seq, p).is_some() {
            debug!(sequence = seq, "duplicate sequence, keeping latest");
        }
        self.max_seen = self.max_seen.max(seq);
        while self.packets.contains_key(&(self.max_contiguous + 1)) {
            self.max_contiguous += 1;
        }
        true
    }

    pub fn contains(&self, seq: i32) -> bool {
        self.packets.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Highest `n` such that every sequence in `1..=n` is present.
    pub fn max_contiguous(&self) -> i32 {
        self.max_contiguous
    }

    pub fn max_seen(&self) -> i32 {
        self.max_seen
    }

    /// Number of sequences absent from `[1, max_seen]`, without listing them.
    pub fn gap_count(&self) -> u64 {
        let span = (self.max_seen - self.max_contiguous) as u64;
        let present = self.packets.range(self.max_contiguous + 1..).count() as u64;
        span - present
    }

    /// Every sequence in `[1, max_seen]` with no packet. Unbounded; check
    /// [`gap_count`](Self::gap_count) first when the input is untrusted.
    pub fn missing(&self) -> MissingSet {
        let set = (self.max_contiguous + 1..self.max_seen)
            .filter(|s| !self.packets.contains_key(s))
            .collect();
        MissingSet(set)
    }

    /// Consume the state, yielding packets in ascending sequence order.
    pub fn into_sorted(self) -> Vec<Packet> {
        self.packets.into_values().collect()
    }
}

/// Ordered set of sequences known to be absent. Empty means complete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MissingSet(BTreeSet<i32>);

impl MissingSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().copied()
    }

    /// Drop every sequence the state now holds.
    pub fn retain_absent(&mut self, state: &ReconstructionState) {
        self.0.retain(|s| !state.contains(*s));
    }

    pub fn to_vec(&self) -> Vec<i32> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<i32> for MissingSet {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        MissingSet(iter.into_iter().collect())
    }
}

/// Feed a whole initial batch into `state` and report what is missing.
/// More than `max_missing` gaps fails with [`FeedError::TooManyGaps`]
/// before any set is built.
pub fn detect_gaps<I>(state: &mut ReconstructionState, batch: I, max_missing: usize) -> Result<MissingSet>
where
    I: IntoIterator<Item = Packet>,
{
    for p in batch {
        state.insert(p);
    }
    let gaps = state.gap_count();
    if gaps > max_missing as u64 {
        return Err(FeedError::TooManyGaps { missing: gaps, limit: max_missing });
    }
    let missing = state.missing();
    debug!(
        received = state.len(),
        max_seen = state.max_seen(),
        max_contiguous = state.max_contiguous(),
        missing = missing.len(),
        "initial batch consumed"
    );
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Side, Symbol};

    fn pkt(seq: i32) -> Packet {
        Packet { symbol: Symbol::new("SYMB").unwrap(), side: Side::Buy, quantity: 1, price: 1, sequence: seq }
    }

    #[test]
    fn contiguous_batch_has_no_gaps() {
        let mut st = ReconstructionState::new();
        let missing = detect_gaps(&mut st, (1..=5).map(pkt), DEFAULT_MAX_MISSING).unwrap();
        assert!(missing.is_empty());
        assert_eq!(st.max_contiguous(), 5);
    }

    #[test]
    fn middle_gap_found() {
        let mut st = ReconstructionState::new();
        let missing = detect_gaps(&mut st, [1, 2, 4, 5].map(pkt), DEFAULT_MAX_MISSING).unwrap();
        assert_eq!(missing.to_vec(), vec![3]);
        assert_eq!(st.max_contiguous(), 2);
    }

    #[test]
    fn out_of_order_arrival_is_not_a_gap() {
        let mut st = ReconstructionState::new();
        let missing = detect_gaps(&mut st, [3, 1, 5, 2, 4].map(pkt), DEFAULT_MAX_MISSING).unwrap();
        assert!(missing.is_empty());
        assert_eq!(st.max_contiguous(), 5);
    }

    #[test]
    fn leading_gap_found() {
        let mut st = ReconstructionState::new();
        let missing = detect_gaps(&mut st, [4, 2].map(pkt), DEFAULT_MAX_MISSING).unwrap();
        assert_eq!(missing.to_vec(), vec![1, 3]);
        assert_eq!(st.max_contiguous(), 0);
    }

    #[test]
    fn huge_sequence_hits_gap_limit_without_listing() {
        let mut st = ReconstructionState::new();
        match detect_gaps(&mut st, [1, i32::MAX].map(pkt), DEFAULT_MAX_MISSING) {
            Err(FeedError::TooManyGaps { missing, limit }) => {
                assert_eq!(missing, i32::MAX as u64 - 2);
                assert_eq!(limit, DEFAULT_MAX_MISSING);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut st = ReconstructionState::new();
        assert_eq!(detect_gaps(&mut st, [1, 5].map(pkt), 3).unwrap().to_vec(), vec![2, 3, 4]);
        let mut st = ReconstructionState::new();
        assert!(detect_gaps(&mut st, [1, 6].map(pkt), 3).is_err());
    }

    #[test]
    fn gap_count_matches_missing() {
        let mut st = ReconstructionState::new();
        for s in [2, 3, 7, 9, 9] {
            st.insert(pkt(s));
        }
        assert_eq!(st.gap_count(), st.missing().len() as u64);
        assert_eq!(st.gap_count(), 5);
    }

    #[test]
    fn empty_batch_complete() {
        let mut st = ReconstructionState::new();
        assert!(detect_gaps(&mut st, Vec::new(), DEFAULT_MAX_MISSING).unwrap().is_empty());
        assert!(st.into_sorted().is_empty());
    }

    #[test]
    fn duplicate_is_last_write_wins() {
        let mut st = ReconstructionState::new();
        st.insert(pkt(1));
        let mut again = pkt(1);
        again.quantity = 42;
        st.insert(again.clone());
        assert_eq!(st.len(), 1);
        assert_eq!(st.into_sorted(), vec![again]);
    }

    #[test]
    fn non_positive_sequence_ignored() {
        let mut st = ReconstructionState::new();
        assert!(!st.insert(pkt(0)));
        assert!(!st.insert(pkt(-4)));
        assert!(st.is_empty());
    }

    #[test]
    fn missing_set_shrinks_as_state_fills() {
        let mut st = ReconstructionState::new();
        let mut missing = detect_gaps(&mut st, [1, 4].map(pkt), DEFAULT_MAX_MISSING).unwrap();
        assert_eq!(missing.to_vec(), vec![2, 3]);
        st.insert(pkt(3));
        missing.retain_absent(&st);
        assert_eq!(missing.to_vec(), vec![2]);
        st.insert(pkt(2));
        missing.retain_absent(&st);
        assert!(missing.is_empty());
        assert_eq!(st.into_sorted().iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }
}
