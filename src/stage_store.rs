//! Stage Store (C4): per-round storage of Stage-1/2/3 messages keyed by
//! trusted index, plus quorum detection (spec §4.4). The slot array and
//! idempotent-insert shape are modeled directly on `exonum::node::state::Votes<T>`,
//! generalized from a single bitset of voters to three independently
//! tracked stage arrays with equivocation detection.

use crate::helpers::{quorum_threshold, TrustedIndex};
use crate::messages::{Stage1, Stage2, Stage3};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageNumber {
    One,
    Two,
    Three,
}

/// A slot is either empty, holds one validated stage, or was excluded for
/// the round because its sender equivocated (spec §4.4, §4.5 failure
/// semantics: "Equivocation ... exclude sender from quorum count"). The
/// first-seen value is kept under `Excluded` so it remains retrievable via
/// `get` even though it no longer contributes to quorum.
#[derive(Debug, Clone)]
enum Slot<T> {
    Empty,
    Occupied(T),
    Excluded(T),
}

struct StageArray<T> {
    slots: Vec<Slot<T>>,
}

impl<T: Clone + PartialEq> StageArray<T> {
    fn new(confidant_count: usize) -> Self {
        StageArray {
            slots: vec![Slot::Empty; confidant_count],
        }
    }

    /// Idempotent on duplicate (same sender index, identical payload ->
    /// accepted silently; differing payload -> equivocation, slot retained
    /// at its first value).
    fn put(&mut self, sender: TrustedIndex, value: T) -> PutOutcome {
        let idx = sender.as_usize();
        if idx >= self.slots.len() {
            return PutOutcome::OutOfRange;
        }
        match &self.slots[idx] {
            Slot::Empty => {
                self.slots[idx] = Slot::Occupied(value);
                PutOutcome::Inserted
            }
            Slot::Occupied(existing) if *existing == value => PutOutcome::DuplicateSame,
            Slot::Occupied(existing) => {
                self.slots[idx] = Slot::Excluded(existing.clone());
                PutOutcome::Equivocation
            }
            Slot::Excluded(_) => PutOutcome::Equivocation,
        }
    }

    fn have(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }

    fn missing(&self) -> Vec<TrustedIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Empty))
            .map(|(i, _)| TrustedIndex(i as u8))
            .collect()
    }

    /// Returns the first-seen value for `sender` whether or not the slot
    /// was later excluded for equivocation.
    fn get(&self, sender: TrustedIndex) -> Option<&T> {
        match self.slots.get(sender.as_usize()) {
            Some(Slot::Occupied(v)) | Some(Slot::Excluded(v)) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone> Clone for Slot<T> {
    fn clone(&self) -> Self {
        match self {
            Slot::Empty => Slot::Empty,
            Slot::Occupied(v) => Slot::Occupied(v.clone()),
            Slot::Excluded(v) => Slot::Excluded(v.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    DuplicateSame,
    Equivocation,
    OutOfRange,
}

/// Per-round storage of Stage-1/2/3 messages (spec §4.4). Owned exclusively
/// by the processor thread (spec §5) — no internal locking.
pub struct StageStore {
    confidant_count: usize,
    stage1: StageArray<Stage1>,
    stage2: StageArray<Stage2>,
    stage3: StageArray<Stage3>,
}

impl StageStore {
    pub fn new(confidant_count: usize) -> Self {
        StageStore {
            confidant_count,
            stage1: StageArray::new(confidant_count),
            stage2: StageArray::new(confidant_count),
            stage3: StageArray::new(confidant_count),
        }
    }

    pub fn put_stage1(&mut self, sender: TrustedIndex, msg: Stage1) -> PutOutcome {
        self.stage1.put(sender, msg)
    }

    pub fn put_stage2(&mut self, sender: TrustedIndex, msg: Stage2) -> PutOutcome {
        self.stage2.put(sender, msg)
    }

    pub fn put_stage3(&mut self, sender: TrustedIndex, msg: Stage3) -> PutOutcome {
        self.stage3.put(sender, msg)
    }

    pub fn get_stage1(&self, sender: TrustedIndex) -> Option<&Stage1> {
        self.stage1.get(sender)
    }

    pub fn get_stage2(&self, sender: TrustedIndex) -> Option<&Stage2> {
        self.stage2.get(sender)
    }

    pub fn get_stage3(&self, sender: TrustedIndex) -> Option<&Stage3> {
        self.stage3.get(sender)
    }

    pub fn have(&self, stage: StageNumber) -> usize {
        match stage {
            StageNumber::One => self.stage1.have(),
            StageNumber::Two => self.stage2.have(),
            StageNumber::Three => self.stage3.have(),
        }
    }

    pub fn find_missing(&self, stage: StageNumber) -> Vec<TrustedIndex> {
        match stage {
            StageNumber::One => self.stage1.missing(),
            StageNumber::Two => self.stage2.missing(),
            StageNumber::Three => self.stage3.missing(),
        }
    }

    /// For stages 1 and 2: `have(stage) >= floor(n/2)+1`. For stage 3:
    /// count of matching writer choices must reach the same threshold
    /// (spec §4.4).
    pub fn quorum(&self, stage: StageNumber) -> bool {
        let threshold = quorum_threshold(self.confidant_count);
        match stage {
            StageNumber::One => self.stage1.have() >= threshold,
            StageNumber::Two => self.stage2.have() >= threshold,
            StageNumber::Three => self.stage3_writer_with_quorum().is_some(),
        }
    }

    /// Elects the writer as the confidant appearing in the largest
    /// coalition of matching Stage-3 `writer` fields, ties broken by lowest
    /// trusted index (spec §4.5). Returns `None` until some candidate
    /// reaches quorum.
    pub fn stage3_writer_with_quorum(&self) -> Option<TrustedIndex> {
        let threshold = quorum_threshold(self.confidant_count);
        let mut counts: std::collections::BTreeMap<u8, usize> = std::collections::BTreeMap::new();
        for slot in &self.stage3.slots {
            if let Slot::Occupied(msg) = slot {
                *counts.entry(msg.writer_idx.0).or_insert(0) += 1;
            }
        }
        let mut best: Option<(u8, usize)> = None;
        for (idx, count) in counts {
            if count >= threshold {
                best = match best {
                    None => Some((idx, count)),
                    Some((best_idx, best_count)) => {
                        if count > best_count || (count == best_count && idx < best_idx) {
                            Some((idx, count))
                        } else {
                            Some((best_idx, best_count))
                        }
                    }
                };
            }
        }
        best.map(|(idx, _)| TrustedIndex(idx))
    }

    /// Senders excluded for the remainder of the round due to equivocation.
    pub fn excluded_senders(&self) -> HashSet<TrustedIndex> {
        let mut out = HashSet::new();
        for (i, slot) in self.stage1.slots.iter().enumerate() {
            if matches!(slot, Slot::Excluded(_)) {
                out.insert(TrustedIndex(i as u8));
            }
        }
        for (i, slot) in self.stage2.slots.iter().enumerate() {
            if matches!(slot, Slot::Excluded(_)) {
                out.insert(TrustedIndex(i as u8));
            }
        }
        for (i, slot) in self.stage3.slots.iter().enumerate() {
            if matches!(slot, Slot::Excluded(_)) {
                out.insert(TrustedIndex(i as u8));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, Signature};
    use crate::helpers::RoundNumber;

    fn stage1(idx: u8) -> Stage1 {
        Stage1 {
            sender_idx: TrustedIndex(idx),
            round: RoundNumber(1),
            mask_hash: Hash::zero(),
            candidate_trusted: vec![],
            candidate_hashes: vec![],
            signature: Signature::zero(),
        }
    }

    #[test]
    fn put_is_idempotent_on_identical_payload() {
        let mut store = StageStore::new(4);
        assert_eq!(
            store.put_stage1(TrustedIndex(0), stage1(0)),
            PutOutcome::Inserted
        );
        assert_eq!(
            store.put_stage1(TrustedIndex(0), stage1(0)),
            PutOutcome::DuplicateSame
        );
        assert_eq!(store.have(StageNumber::One), 1);
    }

    #[test]
    fn differing_payload_is_equivocation_and_retains_first_value() {
        let mut store = StageStore::new(4);
        let first = stage1(0);
        store.put_stage1(TrustedIndex(0), first.clone());
        let mut other = stage1(0);
        other.mask_hash = Hash::from_slice(&[1; 32]).unwrap();
        assert_eq!(
            store.put_stage1(TrustedIndex(0), other),
            PutOutcome::Equivocation
        );
        assert_eq!(store.get_stage1(TrustedIndex(0)), Some(&first));
        assert!(store.excluded_senders().contains(&TrustedIndex(0)));
        assert_eq!(store.have(StageNumber::One), 0);
    }

    #[test]
    fn quorum_for_four_confidants_is_three() {
        let mut store = StageStore::new(4);
        assert!(!store.quorum(StageNumber::One));
        store.put_stage1(TrustedIndex(0), stage1(0));
        store.put_stage1(TrustedIndex(1), stage1(1));
        assert!(!store.quorum(StageNumber::One));
        store.put_stage1(TrustedIndex(2), stage1(2));
        assert!(store.quorum(StageNumber::One));
    }

    #[test]
    fn at_most_one_stage_per_sender_contributes_to_quorum() {
        // P4: stage uniqueness.
        let mut store = StageStore::new(4);
        store.put_stage1(TrustedIndex(0), stage1(0));
        store.put_stage1(TrustedIndex(0), stage1(0));
        store.put_stage1(TrustedIndex(0), stage1(0));
        assert_eq!(store.have(StageNumber::One), 1);
    }

    #[test]
    fn find_missing_lists_empty_slots() {
        use pretty_assertions::assert_eq;
        let mut store = StageStore::new(4);
        store.put_stage1(TrustedIndex(1), stage1(1));
        let missing = store.find_missing(StageNumber::One);
        assert_eq!(missing, vec![TrustedIndex(0), TrustedIndex(2), TrustedIndex(3)]);
    }
}
