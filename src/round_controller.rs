//! Round Controller (C5): state machine driving one node through one
//! round (spec §4.5). Modeled on `exonum::node::consensus`'s
//! `handle_propose`/`handle_prevote`/`handle_precommit` validate-then-dispatch
//! shape, and on Design Notes §9: states are a tagged variant, transitions
//! are a pure `on_event` function returning `Effects` the processor loop
//! interprets (spec §5's single-threaded cooperative view).
//!
//! A `RoundController` instance is created at start-of-round from the
//! incoming round table and destroyed at end-of-round (spec §3 Lifecycle):
//! all transient state (the Stage Store, trusted-candidates) lives here and
//! is dropped with it.

use crate::block::{Block, PendingPackets, RoundTable, Transaction, TransactionPacket, WalletSnapshot};
use crate::config::ConsensusConfig;
use crate::crypto::{Hash, Hasher, PublicKey, SecretKey, Signer};
use crate::error::EventReport;
use crate::helpers::{quorum_threshold, RoundNumber, Sequence, TrustedIndex};
use crate::messages::{Message, Stage1, Stage2, Stage3, StageRequest};
use crate::stage_store::{PutOutcome, StageNumber, StageStore};
use crate::validator::{empty_mask_hash, validate_packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NoState,
    Normal,
    Trusted1,
    Trusted2,
    Trusted3,
    Writer,
    PostRound,
}

/// Where an outbound message should be sent.
#[derive(Debug, Clone)]
pub enum SendTarget {
    Direct(PublicKey),
    Multicast(Vec<PublicKey>),
    Broadcast,
}

/// Opaque timer identity; `cancel` is idempotent (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTag {
    StateTimeout,
    StageRequestDelay,
}

/// Effects a transition emits for the processor loop to interpret (Design
/// Notes §9). No effect here blocks; scheduling/cancelling/sending are all
/// non-blocking hand-offs (spec §5 Suspension points).
#[derive(Debug, Clone)]
pub enum Effect {
    Send(SendTarget, Message),
    ScheduleTimer(TimerTag, u64),
    CancelTimer(TimerTag),
    AppendBlock(Block),
    EmitEvent(EventReport),
    /// Signals the Pool Synchronizer that this node must stop voting because
    /// it detected it is behind (spec §4.5 "Stage-1 hash exchange and tail-catch").
    EnterSync,
}

pub type Effects = Vec<Effect>;

/// Everything the Round Controller needs to act, supplied at construction
/// (Design Notes §9: explicit capability handles, not a reference to an
/// enclosing node object).
pub struct RoundController<'a> {
    config: &'a ConsensusConfig,
    hasher: &'a dyn Hasher,
    signer: &'a dyn Signer,
    wallets: &'a dyn WalletSnapshot,
    conveyor: &'a dyn PendingPackets,

    own_key: PublicKey,
    own_secret: SecretKey,
    own_index: Option<TrustedIndex>,

    table: RoundTable,
    state: State,
    stage_store: StageStore,

    last_hash: Hash,
    last_sequence: Sequence,
    /// Writer of round `R - 1`, i.e. whoever broadcast this round's table;
    /// the addressee of a Normal-role node's `BlockHash` (spec §4.5).
    previous_writer: PublicKey,

    staged_transactions: Vec<Transaction>,
    writer: Option<TrustedIndex>,
}

impl<'a> RoundController<'a> {
    /// `Start` transition (spec §4.5 transition table): role is derived from
    /// whether the node's key appears in the incoming table's confidant list.
    pub fn start(
        table: RoundTable,
        own_key: PublicKey,
        own_secret: SecretKey,
        last_hash: Hash,
        last_sequence: Sequence,
        previous_writer: PublicKey,
        config: &'a ConsensusConfig,
        hasher: &'a dyn Hasher,
        signer: &'a dyn Signer,
        wallets: &'a dyn WalletSnapshot,
        conveyor: &'a dyn PendingPackets,
    ) -> (Self, Effects) {
        let own_index = table.trusted_index_of(&own_key);
        let confidant_count = table.confidant_count();
        let state = if own_index.is_some() {
            State::Trusted1
        } else {
            State::Normal
        };
        let mut effects = vec![Effect::ScheduleTimer(
            TimerTag::StateTimeout,
            config.default_state_timeout,
        )];
        if state == State::Normal {
            effects.push(Effect::Send(
                SendTarget::Direct(previous_writer),
                Message::BlockHash(last_hash),
            ));
        }
        let controller = RoundController {
            config,
            hasher,
            signer,
            wallets,
            conveyor,
            own_key,
            own_secret,
            own_index,
            table,
            state,
            stage_store: StageStore::new(confidant_count),
            last_hash,
            last_sequence,
            previous_writer,
            staged_transactions: Vec::new(),
            writer: None,
        };
        (controller, effects)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn own_index(&self) -> Option<TrustedIndex> {
        self.own_index
    }

    pub fn writer(&self) -> Option<TrustedIndex> {
        self.writer
    }

    fn confidant_count(&self) -> usize {
        self.table.confidant_count()
    }

    fn confidant_at(&self, idx: TrustedIndex) -> Option<PublicKey> {
        self.table.confidants.get(idx.as_usize()).copied()
    }

    /// Stage-1 production (spec §4.5): validates the round's packet,
    /// signs a Stage-1 over its mask hash, and `put`s it into the node's
    /// own Stage Store alongside broadcasting it.
    pub fn on_sync_transactions(&mut self, packet: TransactionPacket) -> Effects {
        if self.state != State::Trusted1 {
            return vec![];
        }
        let Some(own_index) = self.own_index else {
            return vec![];
        };

        let validation = validate_packet(&packet, self.wallets, self.signer, self.last_sequence);
        let mask_hash = if packet.transactions.is_empty() {
            empty_mask_hash(self.table.round, self.hasher)
        } else {
            self.hasher.hash(&mask_to_bytes(&validation.mask))
        };
        self.staged_transactions = packet
            .transactions
            .iter()
            .enumerate()
            .filter(|(i, _)| validation.mask.get(*i).unwrap_or(false))
            .map(|(_, tx)| tx.clone())
            .collect();

        // candidate_hashes = up to H pending packet hashes not already
        // referenced by this round's table (spec §4.5), sourced from the
        // Conveyor rather than from the table's own, already-referenced list.
        let mut already_referenced = self.table.expected_packet_hashes.clone();
        already_referenced.push(packet.hash);
        let candidate_hashes: Vec<Hash> = self
            .conveyor
            .pending_hashes(&already_referenced, self.config.max_candidate_hashes);

        let sig_payload = stage1_signing_bytes(own_index, self.table.round, &mask_hash);
        let signature = self.signer.sign(&self.own_secret, &sig_payload);

        let msg = Stage1 {
            sender_idx: own_index,
            round: self.table.round,
            mask_hash,
            candidate_trusted: self.table.confidants.clone(),
            candidate_hashes: candidate_hashes.clone(),
            signature,
        };

        self.stage_store.put_stage1(own_index, msg.clone());

        let mut effects = vec![Effect::Send(
            SendTarget::Multicast(self.table.confidants.clone()),
            Message::Stage1(msg),
        )];
        effects.extend(self.check_stage1_quorum());
        effects
    }

    /// Validates and stores an incoming Stage-1 message (spec §4.5, §4.4).
    pub fn handle_stage1(&mut self, from: PublicKey, msg: Stage1) -> Effects {
        if msg.round != self.table.round {
            return vec![];
        }
        let Some(sender_key) = self.confidant_at(msg.sender_idx) else {
            return vec![];
        };
        if sender_key != from {
            return vec![];
        }
        let payload = stage1_signing_bytes(msg.sender_idx, msg.round, &msg.mask_hash);
        if !self.signer.verify(&from, &payload, &msg.signature) {
            return vec![Effect::EmitEvent(EventReport::WrongSignature)];
        }

        let outcome = self.stage_store.put_stage1(msg.sender_idx, msg.clone());
        let mut effects = Vec::new();
        if outcome == PutOutcome::Equivocation {
            log::warn!(
                "round {}: equivocating Stage1 from confidant {}",
                self.table.round,
                msg.sender_idx
            );
            effects.push(Effect::EmitEvent(EventReport::Equivocation {
                sender: msg.sender_idx.0,
                stage: 1,
            }));
            return effects;
        }
        effects.extend(self.check_stage1_quorum());
        effects
    }

    fn check_stage1_quorum(&mut self) -> Effects {
        if self.state != State::Trusted1 {
            return vec![];
        }
        if !self.stage_store.quorum(StageNumber::One) {
            return vec![];
        }
        self.state = State::Trusted2;
        self.emit_stage2()
    }

    fn emit_stage2(&mut self) -> Effects {
        let Some(own_index) = self.own_index else {
            return vec![];
        };
        let mut hashes = Vec::new();
        let mut signatures = Vec::new();
        for idx in 0..self.confidant_count() {
            if let Some(s1) = self.stage_store.get_stage1(TrustedIndex(idx as u8)) {
                hashes.push(s1.mask_hash);
                signatures.push(s1.signature);
            }
        }
        let msg = Stage2 {
            sender_idx: own_index,
            round: self.table.round,
            stage1_hashes: hashes,
            signatures,
        };
        self.stage_store.put_stage2(own_index, msg.clone());
        let mut effects = vec![Effect::Send(
            SendTarget::Multicast(self.table.confidants.clone()),
            Message::Stage2(msg),
        )];
        effects.extend(self.check_stage2_quorum());
        effects
    }

    pub fn handle_stage2(&mut self, from: PublicKey, msg: Stage2) -> Effects {
        if msg.round != self.table.round {
            return vec![];
        }
        let Some(sender_key) = self.confidant_at(msg.sender_idx) else {
            return vec![];
        };
        if sender_key != from {
            return vec![];
        }
        let outcome = self.stage_store.put_stage2(msg.sender_idx, msg.clone());
        if outcome == PutOutcome::Equivocation {
            return vec![Effect::EmitEvent(EventReport::Equivocation {
                sender: msg.sender_idx.0,
                stage: 2,
            })];
        }
        self.check_stage2_quorum()
    }

    fn check_stage2_quorum(&mut self) -> Effects {
        if self.state != State::Trusted2 {
            return vec![];
        }
        if !self.stage_store.quorum(StageNumber::Two) {
            return vec![];
        }
        self.state = State::Trusted3;
        self.emit_stage3()
    }

    /// Picks the writer from the collected Stage-1 candidate-trusted lists
    /// (spec §4.5 Writer election happens at Stage-3, but the *candidate*
    /// for this node's own ballot is simply the lowest-index confidant it
    /// has observed Stage-1 from, matching "ties broken by lowest trusted
    /// index" applied locally before the cross-node Stage-3 tally settles
    /// on the global winner).
    fn propose_writer(&self) -> TrustedIndex {
        for idx in 0..self.confidant_count() {
            let ti = TrustedIndex(idx as u8);
            if self.stage_store.get_stage1(ti).is_some() {
                return ti;
            }
        }
        TrustedIndex(0)
    }

    fn emit_stage3(&mut self) -> Effects {
        let Some(own_index) = self.own_index else {
            return vec![];
        };
        let writer_idx = self.propose_writer();
        let block = self.assemble_candidate_block(writer_idx);
        let digest = block.digest(self.hasher);
        let block_signature = self.signer.sign(&self.own_secret, digest.as_bytes());

        let untrusted_mask = self.stage_store.excluded_senders();
        let mut mask = bit_vec::BitVec::from_elem(self.confidant_count(), false);
        for idx in untrusted_mask {
            mask.set(idx.as_usize(), true);
        }

        let msg = Stage3 {
            sender_idx: own_index,
            round: self.table.round,
            writer_idx,
            block_signature,
            untrusted_mask: mask,
        };
        self.stage_store.put_stage3(own_index, msg.clone());
        let mut effects = vec![Effect::Send(
            SendTarget::Multicast(self.table.confidants.clone()),
            Message::Stage3(msg),
        )];
        effects.extend(self.check_stage3_quorum());
        effects
    }

    pub fn handle_stage3(&mut self, from: PublicKey, msg: Stage3) -> Effects {
        if msg.round != self.table.round {
            return vec![];
        }
        let Some(sender_key) = self.confidant_at(msg.sender_idx) else {
            return vec![];
        };
        if sender_key != from {
            return vec![];
        }
        let outcome = self.stage_store.put_stage3(msg.sender_idx, msg.clone());
        if outcome == PutOutcome::Equivocation {
            return vec![Effect::EmitEvent(EventReport::Equivocation {
                sender: msg.sender_idx.0,
                stage: 3,
            })];
        }
        self.check_stage3_quorum()
    }

    fn check_stage3_quorum(&mut self) -> Effects {
        if self.state != State::Trusted3 {
            return vec![];
        }
        let Some(writer) = self.stage_store.stage3_writer_with_quorum() else {
            return vec![];
        };
        self.writer = Some(writer);
        log::debug!("round {}: writer elected as confidant {}", self.table.round, writer);
        if Some(writer) == self.own_index {
            self.state = State::Writer;
            self.become_writer()
        } else {
            self.state = State::PostRound;
            vec![Effect::CancelTimer(TimerTag::StateTimeout)]
        }
    }

    fn assemble_candidate_block(&self, writer_idx: TrustedIndex) -> Block {
        let writer_key = self.confidant_at(writer_idx).unwrap_or(self.own_key);
        Block {
            sequence: self.last_sequence.next(),
            previous_hash: self.last_hash,
            writer_key,
            transactions: self.staged_transactions.clone(),
            signatures: Vec::new(),
            round_timestamp: self.table.starting_timestamp,
        }
    }

    /// Writer actions (spec §4.5): assembles the final block with collected
    /// confidant signatures and appends it.
    fn become_writer(&mut self) -> Effects {
        let Some(own_index) = self.own_index else {
            return vec![];
        };
        let mut block = self.assemble_candidate_block(own_index);
        for idx in 0..self.confidant_count() {
            if let Some(s3) = self.stage_store.get_stage3(TrustedIndex(idx as u8)) {
                if let Some(key) = self.confidant_at(TrustedIndex(idx as u8)) {
                    block.signatures.push((key, s3.block_signature));
                }
            }
        }
        let threshold = quorum_threshold(self.confidant_count());
        let valid_count = block.distinct_valid_signature_count(self.hasher, self.signer);
        if valid_count < threshold {
            log::warn!(
                "round {}: writer could not assemble enough signatures ({} < {})",
                self.table.round,
                block.signatures.len(),
                threshold
            );
            return vec![Effect::EmitEvent(EventReport::RoundStateExpired {
                missing: vec![],
            })];
        }
        log::info!(
            "round {}: appending block at sequence {} with {} signatures",
            self.table.round,
            block.sequence,
            block.signatures.len()
        );
        self.state = State::PostRound;
        vec![
            Effect::CancelTimer(TimerTag::StateTimeout),
            Effect::AppendBlock(block),
        ]
    }

    /// Produces the next round's table once this round's block has been
    /// appended (spec §4.5 Writer actions): confidants/hashes reaching
    /// `>= floor(n/2)+1` multiplicity across observed Stage-1 candidate
    /// lists, clamped to table limits.
    pub fn build_next_round_table(&self, starting_timestamp: i64) -> RoundTable {
        let threshold = quorum_threshold(self.confidant_count());
        let mut confidant_votes: std::collections::HashMap<PublicKey, usize> =
            std::collections::HashMap::new();
        let mut hash_votes: std::collections::HashMap<Hash, usize> = std::collections::HashMap::new();
        for idx in 0..self.confidant_count() {
            if let Some(s1) = self.stage_store.get_stage1(TrustedIndex(idx as u8)) {
                for key in &s1.candidate_trusted {
                    *confidant_votes.entry(*key).or_insert(0) += 1;
                }
                for hash in &s1.candidate_hashes {
                    *hash_votes.entry(*hash).or_insert(0) += 1;
                }
            }
        }
        let mut confidants: Vec<PublicKey> = confidant_votes
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .map(|(key, _)| key)
            .collect();
        confidants.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        confidants.truncate(self.config.max_round_table_size);

        let mut hashes: Vec<Hash> = hash_votes
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .map(|(hash, _)| hash)
            .collect();
        hashes.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        hashes.truncate(self.config.max_candidate_hashes);

        RoundTable {
            round: self.table.round.next(),
            confidants,
            expected_packet_hashes: hashes,
            starting_timestamp,
        }
    }

    /// Confidant side of the hash exchange (spec §4.5): a `BlockHash` arrives
    /// from a Normal-role node that addressed it to this node as the writer
    /// of the previous round. A mismatch against this node's own last-block
    /// hash gets a `HashReply` back so the sender can detect it is lagging.
    pub fn on_block_hash(&self, from: PublicKey, reported_hash: Hash) -> Effects {
        if reported_hash != self.last_hash {
            vec![Effect::Send(
                SendTarget::Direct(from),
                Message::HashReply(self.last_hash),
            )]
        } else {
            vec![]
        }
    }

    /// Normal-role hash-exchange and tail-catch (spec §4.5): if the node's
    /// own last-block hash mismatches, this signals that the node is
    /// lagging and should hand control to the Pool Synchronizer.
    pub fn on_hash_reply(&self, reported_hash: Hash) -> Effects {
        if reported_hash != self.last_hash {
            vec![Effect::EnterSync]
        } else {
            vec![]
        }
    }

    /// Missing-stage requests (spec §4.5): emitted when a `Trusted*` state
    /// has waited `stage_request_delay` without reaching the next quorum.
    pub fn on_stage_request_delay(&self) -> Effects {
        let (stage_number, missing) = match self.state {
            State::Trusted1 => (1u8, self.stage_store.find_missing(StageNumber::One)),
            State::Trusted2 => (2u8, self.stage_store.find_missing(StageNumber::Two)),
            State::Trusted3 => (3u8, self.stage_store.find_missing(StageNumber::Three)),
            _ => return vec![],
        };
        let Some(own_index) = self.own_index else {
            return vec![];
        };
        let mut effects = Vec::new();
        for missing_idx in missing {
            let Some(peer) = self.confidant_at(missing_idx) else {
                continue;
            };
            let request = StageRequest {
                from: own_index,
                required: missing_idx,
                round: self.table.round,
            };
            let message = match stage_number {
                1 => Message::Stage1Request(request),
                2 => Message::Stage2Request(request),
                _ => Message::Stage3Request(request),
            };
            effects.push(Effect::Send(SendTarget::Direct(peer), message));
        }
        effects.push(Effect::ScheduleTimer(
            TimerTag::StageRequestDelay,
            self.config.stage_request_delay,
        ));
        effects
    }

    /// Answers a `StageNRequest` by replaying from the Stage Store if
    /// present (spec §4.4, §4.5).
    pub fn handle_stage_request(&self, from: PublicKey, stage_number: u8, required: TrustedIndex) -> Effects {
        let message = match stage_number {
            1 => self.stage_store.get_stage1(required).cloned().map(Message::Stage1),
            2 => self.stage_store.get_stage2(required).cloned().map(Message::Stage2),
            _ => self.stage_store.get_stage3(required).cloned().map(Message::Stage3),
        };
        match message {
            Some(msg) => vec![Effect::Send(SendTarget::Direct(from), msg)],
            None => vec![],
        }
    }

    /// State timeout (spec §4.5 Failure semantics): `Trusted*` transitions
    /// to `NoState` and awaits the next `RoundTable`; `Writer` aborts
    /// without appending and broadcasts `BlockAlarm`.
    pub fn on_state_timeout(&mut self) -> Effects {
        match self.state {
            State::Trusted1 | State::Trusted2 | State::Trusted3 => {
                let missing = self.all_missing_for_current_state();
                log::warn!(
                    "round {}: state {:?} timed out, missing confidants {:?}",
                    self.table.round,
                    self.state,
                    missing
                );
                self.state = State::NoState;
                vec![Effect::EmitEvent(EventReport::RoundStateExpired { missing })]
            }
            State::Writer => {
                log::warn!("round {}: writer timed out before appending", self.table.round);
                self.state = State::NoState;
                vec![Effect::Send(
                    SendTarget::Broadcast,
                    Message::BlockAlarm(self.table.round),
                )]
            }
            _ => vec![],
        }
    }

    fn all_missing_for_current_state(&self) -> Vec<u8> {
        let stage = match self.state {
            State::Trusted1 => StageNumber::One,
            State::Trusted2 => StageNumber::Two,
            State::Trusted3 => StageNumber::Three,
            _ => return vec![],
        };
        self.stage_store
            .find_missing(stage)
            .into_iter()
            .map(|t| t.0)
            .collect()
    }

    /// `BigBang` for a higher round or a new `RoundTable` both reset to
    /// `NoState` and await the next `Start` (spec §4.5 transition table).
    /// A `RoundTable` for a round lower than current is dropped (spec §9
    /// Open Questions, resolved as Drop).
    pub fn on_round_table_message(&self, incoming_round: RoundNumber) -> RoundTableDisposition {
        if incoming_round <= self.table.round {
            RoundTableDisposition::Drop
        } else {
            RoundTableDisposition::StartNextRound
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTableDisposition {
    Drop,
    StartNextRound,
}

fn mask_to_bytes(mask: &bit_vec::BitVec) -> Vec<u8> {
    mask.to_bytes()
}

fn stage1_signing_bytes(sender: TrustedIndex, round: RoundNumber, mask_hash: &Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 32);
    buf.push(sender.0);
    buf.extend_from_slice(&round.0.to_be_bytes());
    buf.extend_from_slice(mask_hash.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fake::{keypair, FakeCrypto};

    struct NoWallets;
    impl WalletSnapshot for NoWallets {
        fn find_by_id(&self, _wallet_id: u64) -> Option<PublicKey> {
            None
        }
        fn is_known_contract(&self, _address: &PublicKey) -> bool {
            false
        }
        fn is_contract_closed(&self, _address: &PublicKey) -> bool {
            false
        }
        fn derive_contract_address(&self, _deployer: &PublicKey, _inner_id: u64, _payload: &[u8]) -> PublicKey {
            PublicKey::zero()
        }
        fn find_init_transaction(&self, _contract: &PublicKey, _sequence: Sequence) -> Option<Transaction> {
            None
        }
        fn disabled_inner_ids(&self, _source: &PublicKey) -> &[u64] {
            &[]
        }
    }

    struct NoConveyor;
    impl crate::block::PendingPackets for NoConveyor {
        fn pending_hashes(&self, _exclude: &[Hash], _limit: usize) -> Vec<Hash> {
            vec![]
        }
    }

    /// Hands back a fixed pool of pending hashes, filtering out whatever the
    /// caller says is already referenced — used to verify `on_sync_transactions`
    /// sources `candidate_hashes` from the Conveyor, not from the round table.
    struct FixedConveyor(Vec<Hash>);
    impl crate::block::PendingPackets for FixedConveyor {
        fn pending_hashes(&self, exclude: &[Hash], limit: usize) -> Vec<Hash> {
            self.0
                .iter()
                .filter(|h| !exclude.contains(h))
                .take(limit)
                .copied()
                .collect()
        }
    }

    fn four_node_table() -> (Vec<(PublicKey, SecretKey)>, RoundTable) {
        let keys: Vec<_> = (0..4u8).map(|i| keypair(i + 1)).collect();
        let confidants = keys.iter().map(|(pk, _)| *pk).collect();
        let table = RoundTable {
            round: RoundNumber(1),
            confidants,
            expected_packet_hashes: vec![],
            starting_timestamp: 1000,
        };
        (keys, table)
    }

    #[test]
    fn role_assigned_from_confidant_membership() {
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (controller, _) = RoundController::start(
            table.clone(),
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        assert_eq!(controller.state(), State::Trusted1);
        assert_eq!(controller.own_index(), Some(TrustedIndex(0)));

        let (outsider_pk, outsider_sk) = keypair(99);
        let (controller, _) = RoundController::start(
            table,
            outsider_pk,
            outsider_sk,
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        assert_eq!(controller.state(), State::Normal);
        assert_eq!(controller.own_index(), None);
    }

    #[test]
    fn forged_stage1_signature_is_rejected_without_storing() {
        // S2: a byzantine sender's Stage1 carries a signature that does not
        // verify against its claimed payload. It must be flagged and must
        // not occupy that sender's Stage Store slot.
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (mut controller, _) = RoundController::start(
            table,
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        let forged = Stage1 {
            sender_idx: TrustedIndex(1),
            round: RoundNumber(1),
            mask_hash: Hash::zero(),
            candidate_trusted: vec![],
            candidate_hashes: vec![],
            signature: crate::crypto::Signature::zero(),
        };
        let effects = controller.handle_stage1(keys[1].0, forged);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitEvent(EventReport::WrongSignature))));
        assert!(controller.stage_store.get_stage1(TrustedIndex(1)).is_none());
    }

    #[test]
    fn four_node_happy_path_reaches_writer() {
        // S1: four confidants, one packet, all valid -> block at sequence 42.
        let _ = env_logger::try_init();
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let mut controllers: Vec<_> = keys
            .iter()
            .map(|(pk, sk)| {
                RoundController::start(
                    table.clone(),
                    *pk,
                    sk.clone(),
                    Hash::zero(),
                    Sequence(41),
                    PublicKey::zero(),
                    &config,
                    &FakeCrypto,
                    &FakeCrypto,
                    &NoWallets,
                    &NoConveyor,
                )
                .0
            })
            .collect();

        let (a_pk, a_sk) = keypair(1);
        let (b_pk, _) = keypair(2);
        let mut tx = Transaction {
            source: a_pk,
            target: b_pk,
            inner_id: 1,
            max_fee: 100,
            counted_fee: 10,
            is_new_state: false,
            is_deploy: false,
            payload: vec![],
            signature: crate::crypto::Signature::zero(),
        };
        tx.signature = FakeCrypto.sign(&a_sk, &tx.canonical_bytes());
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![tx],
        };

        let mut stage1s = Vec::new();
        for controller in controllers.iter_mut() {
            let effects = controller.on_sync_transactions(packet.clone());
            for effect in effects {
                if let Effect::Send(_, Message::Stage1(msg)) = effect {
                    stage1s.push(msg);
                }
            }
        }

        // Cross-deliver every Stage-1 to every node.
        for i in 0..controllers.len() {
            for (sender_idx, msg) in stage1s.iter().enumerate() {
                if sender_idx == i {
                    continue;
                }
                let from = keys[sender_idx].0;
                controllers[i].handle_stage1(from, msg.clone());
            }
        }
        for controller in &controllers {
            assert_eq!(controller.state(), State::Trusted2);
        }

        // Collect and cross-deliver Stage-2.
        let mut stage2s = Vec::new();
        for (i, controller) in controllers.iter().enumerate() {
            let idx = TrustedIndex(i as u8);
            if let Some(msg) = controller_peek_stage2(controller, idx) {
                stage2s.push(msg);
            }
        }
        // Re-run emit via public API by delivering each other's stage2.
        for i in 0..controllers.len() {
            for (sender_idx, msg) in stage2s.iter().enumerate() {
                if sender_idx == i {
                    continue;
                }
                let from = keys[sender_idx].0;
                controllers[i].handle_stage2(from, msg.clone());
            }
        }
        for controller in &controllers {
            assert_eq!(controller.state(), State::Trusted3);
        }

        let mut stage3s = Vec::new();
        for (i, controller) in controllers.iter().enumerate() {
            let idx = TrustedIndex(i as u8);
            if let Some(msg) = controller.stage_store.get_stage3(idx).cloned() {
                stage3s.push(msg);
            }
        }
        let mut appended_blocks = Vec::new();
        for i in 0..controllers.len() {
            for (sender_idx, msg) in stage3s.iter().enumerate() {
                if sender_idx == i {
                    continue;
                }
                let from = keys[sender_idx].0;
                let effects = controllers[i].handle_stage3(from, msg.clone());
                for effect in effects {
                    if let Effect::AppendBlock(block) = effect {
                        appended_blocks.push((i, block));
                    }
                }
            }
        }

        assert_eq!(appended_blocks.len(), 1, "only the elected writer appends");
        let (_, block) = &appended_blocks[0];
        assert_eq!(block.sequence, Sequence(42));
        assert!(block.signatures.len() >= quorum_threshold(4));
    }

    fn controller_peek_stage2(controller: &RoundController, idx: TrustedIndex) -> Option<Stage2> {
        controller.stage_store.get_stage2(idx).cloned()
    }

    #[test]
    fn stage1_candidate_hashes_are_sourced_from_conveyor_not_table() {
        let (keys, mut table) = four_node_table();
        let already_referenced = Hash::from_slice(&[1; 32]).unwrap();
        let pending = Hash::from_slice(&[2; 32]).unwrap();
        table.expected_packet_hashes = vec![already_referenced];
        let config = ConsensusConfig::default();
        let conveyor = FixedConveyor(vec![already_referenced, pending]);
        let (mut controller, _) = RoundController::start(
            table,
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &conveyor,
        );
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![],
        };
        let effects = controller.on_sync_transactions(packet);
        let stage1 = effects
            .into_iter()
            .find_map(|e| match e {
                Effect::Send(_, Message::Stage1(msg)) => Some(msg),
                _ => None,
            })
            .expect("Stage1 should be emitted");
        // the already-referenced hash must not be offered again; only the
        // genuinely pending one from the Conveyor should appear.
        assert_eq!(stage1.candidate_hashes, vec![pending]);
    }

    #[test]
    fn normal_role_emits_block_hash_to_previous_writer() {
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (outsider_pk, outsider_sk) = keypair(99);
        let previous_writer = keys[2].0;
        let (controller, effects) = RoundController::start(
            table,
            outsider_pk,
            outsider_sk,
            Hash::from_slice(&[5; 32]).unwrap(),
            Sequence(41),
            previous_writer,
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        assert_eq!(controller.state(), State::Normal);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send(SendTarget::Direct(target), Message::BlockHash(hash))
                if *target == previous_writer && *hash == Hash::from_slice(&[5; 32]).unwrap()
        )));
    }

    #[test]
    fn block_hash_mismatch_triggers_hash_reply() {
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (controller, _) = RoundController::start(
            table,
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        let (lagging_peer, _) = keypair(50);
        let effects = controller.on_block_hash(lagging_peer, Hash::from_slice(&[9; 32]).unwrap());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send(SendTarget::Direct(target), Message::HashReply(hash))
                if *target == lagging_peer && *hash == Hash::zero()
        )));
        assert!(controller.on_block_hash(lagging_peer, Hash::zero()).is_empty());
    }

    #[test]
    fn state_timeout_in_trusted1_resets_to_no_state() {
        // S6: timeout leading to round reset.
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (mut controller, _) = RoundController::start(
            table,
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        assert_eq!(controller.state(), State::Trusted1);
        let effects = controller.on_state_timeout();
        assert_eq!(controller.state(), State::NoState);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitEvent(EventReport::RoundStateExpired { .. }))));
    }

    #[test]
    fn round_table_for_lower_round_is_dropped() {
        let (keys, table) = four_node_table();
        let config = ConsensusConfig::default();
        let (controller, _) = RoundController::start(
            table,
            keys[0].0,
            keys[0].1.clone(),
            Hash::zero(),
            Sequence(41),
            PublicKey::zero(),
            &config,
            &FakeCrypto,
            &FakeCrypto,
            &NoWallets,
            &NoConveyor,
        );
        assert_eq!(
            controller.on_round_table_message(RoundNumber(1)),
            RoundTableDisposition::Drop
        );
        assert_eq!(
            controller.on_round_table_message(RoundNumber(2)),
            RoundTableDisposition::StartNextRound
        );
    }
}
