//! Pool Synchronizer (C6): windowed block-range requester, reconciling a
//! lagging local tip with the observed network tip (spec §4.6). Grounded on
//! `original_source/csnode/src/poolsynchronizer.cpp`'s `neededSequences`
//! sliding-window algorithm, generalized into the effect-returning shape the
//! Round Controller uses (Design Notes §9), with peer bookkeeping modeled on
//! `exonum::node::connect_list::ConnectList`.

use crate::block::{Block, ChainAppender, ChainReader};
use crate::config::ConsensusConfig;
use crate::crypto::{Hash, PublicKey};
use crate::error::EventReport;
use crate::helpers::Sequence;
use crate::messages::{BlockRequest, BlockReply};
use std::collections::{BTreeMap, VecDeque};

/// One neighbor's involvement in the current sync session. `requested_sequence`
/// mirrors `neighbourhood.cpp`'s `connection.sequence` free-slot bookkeeping
/// (supplemented ambient detail, not named explicitly in the distilled spec).
#[derive(Debug, Clone)]
struct NeighborSlot {
    peer: PublicKey,
    requested_sequence: Option<Sequence>,
}

#[derive(Debug, Clone)]
struct RequestedEntry {
    rounds_remaining: u32,
    reply_block_count: u32,
    pack_counter: u32,
    neighbor: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Continuing,
    Finished,
    ForkDetected { divergent_at: Sequence },
}

#[derive(Debug, Clone)]
pub enum SyncEffect {
    SendBlockRequest(PublicKey, BlockRequest),
    Applied(Sequence),
    EmitEvent(EventReport),
    Finished,
}

pub type SyncEffects = Vec<SyncEffect>;

/// Per spec §3's Pool Synchronizer state shape. Process-lived: unlike the
/// Round Controller, one instance survives across many rounds.
pub struct PoolSynchronizer<'a> {
    config: &'a ConsensusConfig,
    round_to_sync: u64,
    requested_sequences: BTreeMap<Sequence, RequestedEntry>,
    temporary_storage: BTreeMap<Sequence, Block>,
    neighbors: Vec<NeighborSlot>,
    next_pack_counter: u32,
    active: bool,
    /// Latest common ancestor found by `detect_fork`, if a fork is active.
    /// `needed_sequences` resumes from just past this instead of the local
    /// tip until the fork resolves.
    fork_common_ancestor: Option<Sequence>,
}

impl<'a> PoolSynchronizer<'a> {
    pub fn new(config: &'a ConsensusConfig) -> Self {
        PoolSynchronizer {
            config,
            round_to_sync: 0,
            requested_sequences: BTreeMap::new(),
            temporary_storage: BTreeMap::new(),
            neighbors: Vec::new(),
            next_pack_counter: 0,
            active: false,
            fork_common_ancestor: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Activated when the observed network round exceeds the local chain
    /// tip by `RoundDifferent` (spec §4.6 lead-in).
    pub fn maybe_activate(&mut self, observed_round: u64, local_tip: Sequence) -> bool {
        if !self.active && observed_round > local_tip.0 + self.config.round_different {
            self.active = true;
            self.round_to_sync = observed_round;
            log::info!(
                "pool sync activated: local tip {} lags observed round {} by more than {}",
                local_tip,
                observed_round,
                self.config.round_different
            );
            true
        } else {
            false
        }
    }

    fn refresh_neighbors(&mut self, peers: &[PublicKey]) {
        self.neighbors
            .retain(|slot| peers.contains(&slot.peer));
        for peer in peers {
            if !self.neighbors.iter().any(|slot| slot.peer == *peer) {
                self.neighbors.push(NeighborSlot {
                    peer: *peer,
                    requested_sequence: None,
                });
            }
        }
    }

    /// Step 2: the next `MaxBlockCount` sequences starting after the local
    /// tip, minus ones already in flight or already buffered. While a fork
    /// is active, resumes just past the detected common ancestor instead of
    /// the local tip, so resync doesn't re-request the divergent range.
    fn needed_sequences(&self, chain: &dyn ChainReader) -> VecDeque<Sequence> {
        let mut out = VecDeque::new();
        let mut seq = self
            .fork_common_ancestor
            .unwrap_or_else(|| chain.last_sequence())
            .next();
        while out.len() < self.config.max_block_count {
            let in_flight = self
                .requested_sequences
                .get(&seq)
                .map(|e| e.rounds_remaining > 0 && e.reply_block_count > 0)
                .unwrap_or(false);
            let buffered = self.temporary_storage.contains_key(&seq);
            if !in_flight && !buffered {
                out.push_back(seq);
            }
            seq = seq.next();
        }
        out
    }

    /// One synchronizer tick (spec §4.6 steps 1-3): frees arrived-for
    /// neighbor slots, computes `neededSequences`, and assigns the head of
    /// the queue to each free neighbor.
    pub fn tick(&mut self, peers: &[PublicKey], chain: &dyn ChainReader) -> SyncEffects {
        if !self.active {
            return vec![];
        }
        self.refresh_neighbors(peers);

        let mut needed = self.needed_sequences(chain);
        let mut effects = Vec::new();

        for slot in self.neighbors.iter_mut() {
            if slot.requested_sequence.is_some() {
                continue;
            }
            let Some(sequence) = needed.pop_front() else {
                break;
            };
            self.next_pack_counter = self.next_pack_counter.wrapping_add(1);
            let pack_counter = self.next_pack_counter;
            slot.requested_sequence = Some(sequence);
            self.requested_sequences.insert(
                sequence,
                RequestedEntry {
                    rounds_remaining: self.config.max_wait_round,
                    reply_block_count: self.config.max_wait_reply,
                    pack_counter,
                    neighbor: slot.peer,
                },
            );
            effects.push(SyncEffect::SendBlockRequest(
                slot.peer,
                BlockRequest {
                    pack_counter,
                    sequences: vec![sequence.0],
                },
            ));
        }
        effects
    }

    /// Step 4: apply an incoming `BlockReply`, draining `temporaryStorage`
    /// in order as the local tip advances.
    pub fn on_block_reply(
        &mut self,
        from: PublicKey,
        reply: BlockReply,
        chain: &dyn ChainReader,
        appender: &dyn ChainAppender,
    ) -> (SyncEffects, SyncOutcome) {
        let mut effects = Vec::new();
        let mut freed_any = false;

        for block in reply.blocks {
            let sequence = block.sequence;
            let tip = chain.last_sequence();
            if sequence.0 <= tip.0 {
                continue;
            }
            if sequence == tip.next() {
                if appender.append(block).is_err() {
                    effects.push(SyncEffect::EmitEvent(EventReport::NonContiguousBlock {
                        sequence,
                    }));
                    continue;
                }
                effects.push(SyncEffect::Applied(sequence));
                self.drain_temporary_storage(chain, appender, &mut effects);
            } else {
                self.temporary_storage.insert(sequence, block);
            }
            self.requested_sequences.remove(&sequence);
            freed_any = true;
        }

        if freed_any {
            for slot in self.neighbors.iter_mut() {
                if slot.peer == from {
                    slot.requested_sequence = None;
                }
            }
        } else {
            // Unrelated reply: counts against this neighbor's pending entries.
            for entry in self.requested_sequences.values_mut() {
                if entry.neighbor == from && entry.reply_block_count > 0 {
                    entry.reply_block_count -= 1;
                }
            }
        }

        let outcome = self.check_finished(chain);
        (effects, outcome)
    }

    fn drain_temporary_storage(
        &mut self,
        chain: &dyn ChainReader,
        appender: &dyn ChainAppender,
        effects: &mut SyncEffects,
    ) {
        loop {
            let next = chain.last_sequence().next();
            let Some(block) = self.temporary_storage.remove(&next) else {
                break;
            };
            if appender.append(block).is_ok() {
                effects.push(SyncEffect::Applied(next));
            } else {
                break;
            }
        }
    }

    /// Step 5: round-advance decrement of `roundsRemaining`; entries that
    /// hit zero become re-eligible for request on a different neighbor.
    pub fn on_round_advance(&mut self) {
        let mut expired = Vec::new();
        for (sequence, entry) in self.requested_sequences.iter_mut() {
            if entry.rounds_remaining > 0 {
                entry.rounds_remaining -= 1;
            }
            if entry.rounds_remaining == 0 || entry.reply_block_count == 0 {
                expired.push(*sequence);
            }
        }
        for sequence in expired {
            if let Some(entry) = self.requested_sequences.remove(&sequence) {
                for slot in self.neighbors.iter_mut() {
                    if slot.peer == entry.neighbor && slot.requested_sequence == Some(sequence) {
                        slot.requested_sequence = None;
                    }
                }
            }
        }
    }

    /// Step 6: once the local tip reaches `roundToSync`, clear state and
    /// report completion so the Round Controller can resume voting.
    fn check_finished(&mut self, chain: &dyn ChainReader) -> SyncOutcome {
        if self.active && chain.last_sequence().0 >= self.round_to_sync {
            log::info!("pool sync finished: local tip reached {}", chain.last_sequence());
            self.active = false;
            self.requested_sequences.clear();
            self.temporary_storage.clear();
            self.neighbors.clear();
            self.fork_common_ancestor = None;
            SyncOutcome::Finished
        } else {
            SyncOutcome::Continuing
        }
    }

    /// Fork detection (spec §4.6): walks previous-hashes backward from the
    /// buffered tail; on divergence from the local chain before a shared
    /// ancestor, trims the needed-sequence start to the latest common
    /// ancestor and reports the fork (local history is never rewritten here).
    /// The common ancestor (the sequence just before the divergence) is kept
    /// in `fork_common_ancestor` so `needed_sequences` resumes there rather
    /// than from the local tip until `resolve_fork` clears it.
    pub fn detect_fork(&mut self, chain: &dyn ChainReader, observed_chain_tail: &[(Sequence, Hash)]) -> Option<Sequence> {
        for (sequence, observed_prev_hash) in observed_chain_tail {
            if let Some(local_block) = chain.block_at(*sequence) {
                if local_block.previous_hash != *observed_prev_hash {
                    log::warn!("fork detected diverging at sequence {}", sequence);
                    self.temporary_storage.retain(|seq, _| *seq < *sequence);
                    self.requested_sequences.retain(|seq, _| *seq < *sequence);
                    self.fork_common_ancestor = sequence.previous();
                    return Some(*sequence);
                }
            }
        }
        None
    }

    /// Clears fork state once the local chain has been rebuilt past the
    /// divergence point, letting `needed_sequences` resume tracking the
    /// local tip again.
    pub fn resolve_fork(&mut self) {
        self.fork_common_ancestor = None;
    }
}
