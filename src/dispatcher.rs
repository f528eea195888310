//! Event Dispatcher (C7): classifies inbound packets into
//! process-now / postpone-to-round-R / drop, and routes accordingly
//! (spec §4.7). Modeled on `exonum::node::state::State`'s postponed-message
//! queue management, generalized to the three-way disposition this protocol
//! needs.

use crate::helpers::RoundNumber;
use crate::messages::{Command, Message, MessageClass};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Process,
    Postpone,
    Drop,
}

/// `roundTimeout(type)` (spec §4.7): 100 for smart-stage types (Stage-1/2/3
/// and their requests), `MetaCapacity` for transaction-packet types
/// (RoundTable, which references packet hashes), 5 for everything else that
/// is round-scoped.
fn round_timeout(command: Command, meta_capacity: u64) -> u64 {
    match command {
        Command::Stage1
        | Command::Stage2
        | Command::Stage3
        | Command::Stage1Request
        | Command::Stage2Request
        | Command::Stage3Request => 100,
        Command::RoundTable | Command::RoundTableReply => meta_capacity,
        _ => 5,
    }
}

/// Whether this command is processed regardless of round (spec §4.7).
/// `BlockHash`/`HashReply` join this set too: tail-catch exists precisely so
/// a node whose round view is stale can still be told it is lagging.
fn always_process(command: Command) -> bool {
    matches!(
        command,
        Command::BlockRequest
            | Command::BlockReply
            | Command::BigBang
            | Command::RoundTableRequest
            | Command::RoundTable
            | Command::Registration
            | Command::RegistrationConfirmed
            | Command::RegistrationRefused
            | Command::Ping
            | Command::BlockHash
            | Command::HashReply
    )
}

/// `choose(currentRound, senderRound, type)` (spec §4.7).
pub fn choose(
    current_round: RoundNumber,
    sender_round: RoundNumber,
    command: Command,
    meta_capacity: u64,
) -> Disposition {
    if always_process(command) || command.class() == MessageClass::NetworkControl {
        return Disposition::Process;
    }
    let timeout = round_timeout(command, meta_capacity);
    if sender_round.0 + timeout < current_round.0 {
        return Disposition::Drop;
    }
    if sender_round.0 > current_round.0 {
        return Disposition::Postpone;
    }
    Disposition::Process
}

/// Bounded ring buffer of recent `EventReport`s (supplemented ambient
/// feature, grounded on `original_source/csnode/src/eventreport.cpp`'s
/// in-memory report sink — the on-disk persistence that file also performs
/// is out of scope, spec §1 Out-of-scope: persistent stores).
pub const EVENT_LOG_CAPACITY: usize = 256;

pub struct EventLog {
    entries: std::collections::VecDeque<crate::error::EventReport>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            entries: std::collections::VecDeque::with_capacity(EVENT_LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, report: crate::error::EventReport) {
        if self.entries.len() == EVENT_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(report);
    }

    pub fn recent(&self) -> impl Iterator<Item = &crate::error::EventReport> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches decoded packets by round, replaying postponed buckets once
/// `current_round` catches up to them (spec §4.7).
pub struct Dispatcher {
    meta_capacity: u64,
    current_round: RoundNumber,
    postponed: HashMap<RoundNumber, Vec<(crate::crypto::PublicKey, Message)>>,
    pub event_log: EventLog,
}

impl Dispatcher {
    pub fn new(meta_capacity: u64) -> Self {
        Dispatcher {
            meta_capacity,
            current_round: RoundNumber::zero(),
            postponed: HashMap::new(),
            event_log: EventLog::new(),
        }
    }

    pub fn current_round(&self) -> RoundNumber {
        self.current_round
    }

    /// Classifies one inbound message. `Postpone` enqueues it under its
    /// declared round for later replay; `Process`/`Drop` are left for the
    /// caller to act on immediately.
    pub fn classify(&mut self, from: crate::crypto::PublicKey, message: Message) -> Disposition {
        let sender_round = message.round();
        let command = Command::of(&message);
        let disposition = choose(self.current_round, sender_round, command, self.meta_capacity);
        match disposition {
            Disposition::Postpone => {
                log::trace!(
                    "postponing {:?} from round {} until round {}",
                    command,
                    self.current_round,
                    sender_round
                );
                self.postponed
                    .entry(sender_round)
                    .or_insert_with(Vec::new)
                    .push((from, message));
            }
            Disposition::Drop => {
                log::trace!(
                    "dropping stale {:?} from round {} (current round {})",
                    command,
                    sender_round,
                    self.current_round
                );
            }
            Disposition::Process => {}
        }
        disposition
    }

    /// Advances the dispatcher's view of the current round, returning every
    /// message postponed under rounds now reachable (spec §4.7: "Postponed
    /// buckets are replayed whenever currentRound reaches their key").
    pub fn advance_round(&mut self, new_round: RoundNumber) -> Vec<(crate::crypto::PublicKey, Message)> {
        self.current_round = new_round;
        self.postponed.remove(&new_round).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fake::keypair;
    use crate::messages::{Ping, Stage1};

    fn stage1_at(round: u64) -> Message {
        Message::Stage1(Stage1 {
            sender_idx: crate::helpers::TrustedIndex(0),
            round: RoundNumber(round),
            mask_hash: crate::crypto::Hash::zero(),
            candidate_trusted: vec![],
            candidate_hashes: vec![],
            signature: crate::crypto::Signature::zero(),
        })
    }

    #[test]
    fn stale_stage_message_is_dropped() {
        assert_eq!(
            choose(RoundNumber(200), RoundNumber(1), Command::Stage1, 10),
            Disposition::Drop
        );
    }

    #[test]
    fn future_round_message_is_postponed() {
        assert_eq!(
            choose(RoundNumber(1), RoundNumber(5), Command::Stage1, 10),
            Disposition::Postpone
        );
    }

    #[test]
    fn current_round_message_is_processed() {
        assert_eq!(
            choose(RoundNumber(5), RoundNumber(5), Command::Stage1, 10),
            Disposition::Process
        );
    }

    #[test]
    fn block_request_always_processes_regardless_of_round() {
        assert_eq!(
            choose(RoundNumber(500), RoundNumber(0), Command::BlockRequest, 10),
            Disposition::Process
        );
    }

    #[test]
    fn postponed_message_replays_when_round_advances() {
        let mut dispatcher = Dispatcher::new(10);
        let (peer, _) = keypair(1);
        let disposition = dispatcher.classify(peer, stage1_at(5));
        assert_eq!(disposition, Disposition::Postpone);
        assert!(dispatcher.advance_round(RoundNumber(4)).is_empty());
        let replayed = dispatcher.advance_round(RoundNumber(5));
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn event_log_is_bounded() {
        let mut log = EventLog::new();
        for _ in 0..(EVENT_LOG_CAPACITY + 10) {
            log.push(crate::error::EventReport::WrongSignature);
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
    }

    #[test]
    fn ping_is_network_control_and_always_processed() {
        let (peer, _) = keypair(2);
        let mut dispatcher = Dispatcher::new(10);
        let disposition = dispatcher.classify(
            peer,
            Message::Ping(Ping { last_seq: 0 }),
        );
        assert_eq!(disposition, Disposition::Process);
    }
}
