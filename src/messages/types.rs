//! Consensus message and block-request payload types (spec §4.1, wire shapes
//! in §6). Grounded on `exonum::messages::protocol`'s per-message structs,
//! generalized from Propose/Prevote/Precommit to Stage-1/2/3.

use crate::block::{Block, RoundTable};
use crate::crypto::{Hash, PublicKey, Signature};
use crate::error::RegistrationRefusalReason;
use crate::helpers::{RoundNumber, TrustedIndex};
use bit_vec::BitVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub version: u16,
    pub chain_uuid: u64,
    pub last_seq: u64,
    pub round: RoundNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub pack_counter: u32,
    pub sequences: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct BlockReply {
    pub pack_counter: u32,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage1 {
    pub sender_idx: TrustedIndex,
    pub round: RoundNumber,
    pub mask_hash: Hash,
    pub candidate_trusted: Vec<PublicKey>,
    pub candidate_hashes: Vec<Hash>,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage2 {
    pub sender_idx: TrustedIndex,
    pub round: RoundNumber,
    pub stage1_hashes: Vec<Hash>,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage3 {
    pub sender_idx: TrustedIndex,
    pub round: RoundNumber,
    pub writer_idx: TrustedIndex,
    pub block_signature: Signature,
    pub untrusted_mask: BitVec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRequest {
    pub from: TrustedIndex,
    pub required: TrustedIndex,
    pub round: RoundNumber,
}

#[derive(Debug, Clone)]
pub struct RoundTableReply {
    pub table: RoundTable,
}

#[derive(Debug, Clone)]
pub struct EventReportMsg {
    pub round: RoundNumber,
    pub kind: u8,
    pub detail: Vec<u8>,
}

/// Tagged union over a byte discriminator (spec §4.1). Every variant except
/// `Registration`/`Ping` carries the originating round explicitly.
#[derive(Debug, Clone)]
pub enum Message {
    Registration(Registration),
    RegistrationConfirmed,
    RegistrationRefused(RegistrationRefusalReason),
    Ping(Ping),
    BlockRequest(BlockRequest),
    BlockReply(BlockReply),
    Stage1(Stage1),
    Stage2(Stage2),
    Stage3(Stage3),
    Stage1Request(StageRequest),
    Stage2Request(StageRequest),
    Stage3Request(StageRequest),
    RoundTable(RoundTable),
    RoundTableRequest(RoundNumber),
    RoundTableReply(RoundTableReply),
    BigBang(RoundNumber),
    EmptyRoundPack(RoundNumber),
    BlockAlarm(RoundNumber),
    EventReport(EventReportMsg),
    /// Sent by a Normal-role node to the writer of the previous round,
    /// carrying its own last-block hash (spec §4.5 "Stage-1 hash exchange
    /// and tail-catch").
    BlockHash(Hash),
    /// Sent back by the recipient of `BlockHash` when its own last-block
    /// hash differs from the one reported.
    HashReply(Hash),
}

impl Message {
    /// The round this message declares itself as belonging to. For
    /// `Registration`/`Ping` this is the sender's current round, not a
    /// target round (spec §4.1).
    pub fn round(&self) -> RoundNumber {
        match self {
            Message::Registration(m) => m.round,
            Message::Stage1(m) => m.round,
            Message::Stage2(m) => m.round,
            Message::Stage3(m) => m.round,
            Message::Stage1Request(m) | Message::Stage2Request(m) | Message::Stage3Request(m) => {
                m.round
            }
            Message::RoundTable(t) => t.round,
            Message::RoundTableRequest(r) => *r,
            Message::RoundTableReply(r) => r.table.round,
            Message::BigBang(r) => *r,
            Message::EmptyRoundPack(r) => *r,
            Message::BlockAlarm(r) => *r,
            Message::EventReport(e) => e.round,
            // Block request/reply and registration-confirmed/refused are not
            // round-scoped (spec §4.7 treats them as process-regardless).
            // BlockHash/HashReply are also not round-scoped: they carry only
            // a chain hash, addressed directly rather than tied to a round.
            Message::RegistrationConfirmed
            | Message::RegistrationRefused(_)
            | Message::Ping(_)
            | Message::BlockRequest(_)
            | Message::BlockReply(_)
            | Message::BlockHash(_)
            | Message::HashReply(_) => RoundNumber::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Registration = 0,
    RegistrationConfirmed = 1,
    RegistrationRefused = 2,
    Ping = 3,
    BlockRequest = 4,
    BlockReply = 5,
    Stage1 = 6,
    Stage2 = 7,
    Stage3 = 8,
    Stage1Request = 9,
    Stage2Request = 10,
    Stage3Request = 11,
    RoundTable = 12,
    RoundTableRequest = 13,
    RoundTableReply = 14,
    BigBang = 15,
    EmptyRoundPack = 16,
    BlockAlarm = 17,
    EventReport = 18,
    BlockHash = 19,
    HashReply = 20,
}

impl Command {
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Command::*;
        Some(match byte {
            0 => Registration,
            1 => RegistrationConfirmed,
            2 => RegistrationRefused,
            3 => Ping,
            4 => BlockRequest,
            5 => BlockReply,
            6 => Stage1,
            7 => Stage2,
            8 => Stage3,
            9 => Stage1Request,
            10 => Stage2Request,
            11 => Stage3Request,
            12 => RoundTable,
            13 => RoundTableRequest,
            14 => RoundTableReply,
            15 => BigBang,
            16 => EmptyRoundPack,
            17 => BlockAlarm,
            18 => EventReport,
            19 => BlockHash,
            20 => HashReply,
            _ => return None,
        })
    }

    pub fn of(message: &Message) -> Self {
        match message {
            Message::Registration(_) => Command::Registration,
            Message::RegistrationConfirmed => Command::RegistrationConfirmed,
            Message::RegistrationRefused(_) => Command::RegistrationRefused,
            Message::Ping(_) => Command::Ping,
            Message::BlockRequest(_) => Command::BlockRequest,
            Message::BlockReply(_) => Command::BlockReply,
            Message::Stage1(_) => Command::Stage1,
            Message::Stage2(_) => Command::Stage2,
            Message::Stage3(_) => Command::Stage3,
            Message::Stage1Request(_) => Command::Stage1Request,
            Message::Stage2Request(_) => Command::Stage2Request,
            Message::Stage3Request(_) => Command::Stage3Request,
            Message::RoundTable(_) => Command::RoundTable,
            Message::RoundTableRequest(_) => Command::RoundTableRequest,
            Message::RoundTableReply(_) => Command::RoundTableReply,
            Message::BigBang(_) => Command::BigBang,
            Message::EmptyRoundPack(_) => Command::EmptyRoundPack,
            Message::BlockAlarm(_) => Command::BlockAlarm,
            Message::EventReport(_) => Command::EventReport,
            Message::BlockHash(_) => Command::BlockHash,
            Message::HashReply(_) => Command::HashReply,
        }
    }
}

/// Network-control vs node-traffic distinction carried in the flags byte
/// (spec §6). Only node-traffic messages participate in round-based
/// postponement (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    NetworkControl,
    NodeTraffic,
}

impl Command {
    pub fn class(self) -> MessageClass {
        match self {
            Command::Registration
            | Command::RegistrationConfirmed
            | Command::RegistrationRefused
            | Command::Ping => MessageClass::NetworkControl,
            _ => MessageClass::NodeTraffic,
        }
    }
}
