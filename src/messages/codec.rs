//! Wire codec: `encode(message) -> Vec<u8>` / `decode(bytes) -> Result<Message, Malformed>`
//! (spec §4.1, bit-level layouts in §6). Grounded on `exonum::messages::raw`'s
//! length-prefixed, byte-discriminated framing, using `byteorder` exactly as
//! that module does. Signatures are not verified here — that is the Round
//! Controller's job post-decode (spec §4.1).

use super::types::*;
use crate::block::{Block, Transaction};
use crate::crypto::{Hash, PublicKey, Signature, HASH_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::error::RegistrationRefusalReason;
use crate::helpers::{RoundNumber, Sequence, TrustedIndex};
use bit_vec::BitVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Malformed {
    #[error("buffer ended before declared payload was read")]
    Truncated,
    #[error("unknown command discriminator {0}")]
    UnknownCommand(u8),
    #[error("declared length field did not match remaining buffer")]
    LengthMismatch,
}

impl From<io::Error> for Malformed {
    fn from(_: io::Error) -> Self {
        Malformed::Truncated
    }
}

fn write_fixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}

fn read_fixed<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>, Malformed> {
    let mut out = vec![0u8; len];
    r.read_exact(&mut out).map_err(|_| Malformed::Truncated)?;
    Ok(out)
}

fn read_hash<R: Read>(r: &mut R) -> Result<Hash, Malformed> {
    let bytes = read_fixed(r, HASH_SIZE)?;
    Ok(Hash::from_slice(&bytes).unwrap())
}

fn read_key<R: Read>(r: &mut R) -> Result<PublicKey, Malformed> {
    let bytes = read_fixed(r, PUBLIC_KEY_SIZE)?;
    Ok(PublicKey::from_slice(&bytes).unwrap())
}

fn read_sig<R: Read>(r: &mut R) -> Result<Signature, Malformed> {
    let bytes = read_fixed(r, SIGNATURE_SIZE)?;
    Ok(Signature::from_slice(&bytes).unwrap())
}

fn write_transaction(buf: &mut Vec<u8>, tx: &Transaction) {
    write_fixed(buf, tx.source.as_bytes());
    write_fixed(buf, tx.target.as_bytes());
    buf.write_u64::<BigEndian>(tx.inner_id).unwrap();
    buf.write_u64::<BigEndian>(tx.max_fee).unwrap();
    buf.write_u64::<BigEndian>(tx.counted_fee).unwrap();
    let flags = (tx.is_new_state as u8) | ((tx.is_deploy as u8) << 1);
    buf.write_u8(flags).unwrap();
    buf.write_u32::<BigEndian>(tx.payload.len() as u32).unwrap();
    write_fixed(buf, &tx.payload);
    write_fixed(buf, tx.signature.as_bytes());
}

fn read_transaction<R: Read>(r: &mut R) -> Result<Transaction, Malformed> {
    let source = read_key(r)?;
    let target = read_key(r)?;
    let inner_id = r.read_u64::<BigEndian>()?;
    let max_fee = r.read_u64::<BigEndian>()?;
    let counted_fee = r.read_u64::<BigEndian>()?;
    let flags = r.read_u8()?;
    let len = r.read_u32::<BigEndian>()? as usize;
    let payload = read_fixed(r, len)?;
    let signature = read_sig(r)?;
    Ok(Transaction {
        source,
        target,
        inner_id,
        max_fee,
        counted_fee,
        is_new_state: flags & 1 != 0,
        is_deploy: flags & 2 != 0,
        payload,
        signature,
    })
}

/// Persisted block binary format (spec §6), shared by `BlockReply` entries.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u64::<BigEndian>(block.sequence.0).unwrap();
    write_fixed(&mut buf, block.previous_hash.as_bytes());
    write_fixed(&mut buf, block.writer_key.as_bytes());
    buf.write_i64::<BigEndian>(block.round_timestamp).unwrap();
    buf.write_u32::<BigEndian>(block.transactions.len() as u32).unwrap();
    for tx in &block.transactions {
        write_transaction(&mut buf, tx);
    }
    buf.write_u8(block.signatures.len() as u8).unwrap();
    for (key, sig) in &block.signatures {
        write_fixed(&mut buf, key.as_bytes());
        write_fixed(&mut buf, sig.as_bytes());
    }
    buf
}

pub fn decode_block<R: Read>(r: &mut R) -> Result<Block, Malformed> {
    let sequence = Sequence(r.read_u64::<BigEndian>()?);
    let previous_hash = read_hash(r)?;
    let writer_key = read_key(r)?;
    let round_timestamp = r.read_i64::<BigEndian>()?;
    let tx_count = r.read_u32::<BigEndian>()? as usize;
    let mut transactions = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        transactions.push(read_transaction(r)?);
    }
    let sig_count = r.read_u8()? as usize;
    let mut signatures = Vec::with_capacity(sig_count);
    for _ in 0..sig_count {
        let key = read_key(r)?;
        let sig = read_sig(r)?;
        signatures.push((key, sig));
    }
    Ok(Block {
        sequence,
        previous_hash,
        writer_key,
        transactions,
        signatures,
        round_timestamp,
    })
}

/// Encodes a message to its wire representation: `u8 flags || u8 command || payload`.
pub fn encode(message: &Message) -> Vec<u8> {
    let command = Command::of(message);
    let mut buf = Vec::new();
    let flags: u8 = match command.class() {
        MessageClass::NetworkControl => 0,
        MessageClass::NodeTraffic => 1,
    };
    buf.write_u8(flags).unwrap();
    buf.write_u8(command as u8 as u8).unwrap();

    match message {
        Message::Registration(m) => {
            buf.write_u16::<BigEndian>(m.version).unwrap();
            buf.write_u64::<BigEndian>(m.chain_uuid).unwrap();
            buf.write_u64::<BigEndian>(m.last_seq).unwrap();
            buf.write_u64::<BigEndian>(m.round.0).unwrap();
        }
        Message::RegistrationConfirmed => {}
        Message::RegistrationRefused(reason) => {
            buf.write_u8(*reason as u8).unwrap();
        }
        Message::Ping(m) => {
            buf.write_u64::<BigEndian>(m.last_seq).unwrap();
        }
        Message::BlockRequest(m) => {
            buf.write_u32::<BigEndian>(m.pack_counter).unwrap();
            buf.write_u32::<BigEndian>(m.sequences.len() as u32).unwrap();
            for seq in &m.sequences {
                buf.write_u64::<BigEndian>(*seq).unwrap();
            }
        }
        Message::BlockReply(m) => {
            buf.write_u32::<BigEndian>(m.pack_counter).unwrap();
            buf.write_u32::<BigEndian>(m.blocks.len() as u32).unwrap();
            for block in &m.blocks {
                let encoded = encode_block(block);
                buf.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
                write_fixed(&mut buf, &encoded);
            }
        }
        Message::Stage1(m) => {
            buf.write_u8(m.sender_idx.0).unwrap();
            buf.write_u64::<BigEndian>(m.round.0).unwrap();
            write_fixed(&mut buf, m.mask_hash.as_bytes());
            buf.write_u8(m.candidate_trusted.len() as u8).unwrap();
            for key in &m.candidate_trusted {
                write_fixed(&mut buf, key.as_bytes());
            }
            buf.write_u8(m.candidate_hashes.len() as u8).unwrap();
            for hash in &m.candidate_hashes {
                write_fixed(&mut buf, hash.as_bytes());
            }
            write_fixed(&mut buf, m.signature.as_bytes());
        }
        Message::Stage2(m) => {
            buf.write_u8(m.sender_idx.0).unwrap();
            buf.write_u64::<BigEndian>(m.round.0).unwrap();
            buf.write_u8(m.stage1_hashes.len() as u8).unwrap();
            for hash in &m.stage1_hashes {
                write_fixed(&mut buf, hash.as_bytes());
            }
            for sig in &m.signatures {
                write_fixed(&mut buf, sig.as_bytes());
            }
        }
        Message::Stage3(m) => {
            buf.write_u8(m.sender_idx.0).unwrap();
            buf.write_u64::<BigEndian>(m.round.0).unwrap();
            buf.write_u8(m.writer_idx.0).unwrap();
            write_fixed(&mut buf, m.block_signature.as_bytes());
            let mask_bytes = m.untrusted_mask.to_bytes();
            buf.write_u8(mask_bytes.len() as u8).unwrap();
            write_fixed(&mut buf, &mask_bytes);
        }
        Message::Stage1Request(m) | Message::Stage2Request(m) | Message::Stage3Request(m) => {
            buf.write_u8(m.from.0).unwrap();
            buf.write_u8(m.required.0).unwrap();
            buf.write_u64::<BigEndian>(m.round.0).unwrap();
        }
        Message::RoundTable(t) => {
            buf.write_u64::<BigEndian>(t.round.0).unwrap();
            buf.write_i64::<BigEndian>(t.starting_timestamp).unwrap();
            buf.write_u8(t.confidants.len() as u8).unwrap();
            for key in &t.confidants {
                write_fixed(&mut buf, key.as_bytes());
            }
            buf.write_u8(t.expected_packet_hashes.len() as u8).unwrap();
            for hash in &t.expected_packet_hashes {
                write_fixed(&mut buf, hash.as_bytes());
            }
        }
        Message::RoundTableRequest(round) => {
            buf.write_u64::<BigEndian>(round.0).unwrap();
        }
        Message::RoundTableReply(r) => {
            let inner = encode(&Message::RoundTable(r.table.clone()));
            // Strip the flags/command header of the nested encoding; the
            // table payload alone follows the RoundTableReply discriminator.
            write_fixed(&mut buf, &inner[2..]);
        }
        Message::BigBang(round) | Message::EmptyRoundPack(round) | Message::BlockAlarm(round) => {
            buf.write_u64::<BigEndian>(round.0).unwrap();
        }
        Message::EventReport(e) => {
            buf.write_u64::<BigEndian>(e.round.0).unwrap();
            buf.write_u8(e.kind).unwrap();
            buf.write_u32::<BigEndian>(e.detail.len() as u32).unwrap();
            write_fixed(&mut buf, &e.detail);
        }
        Message::BlockHash(hash) | Message::HashReply(hash) => {
            write_fixed(&mut buf, hash.as_bytes());
        }
    }
    buf
}

/// Decodes a message, rejecting any buffer whose declared payload length
/// does not match the available bytes with `Malformed` (spec §4.1).
pub fn decode(bytes: &[u8]) -> Result<Message, Malformed> {
    let mut cursor = Cursor::new(bytes);
    let _flags = cursor.read_u8()?;
    let command_byte = cursor.read_u8()?;
    let command = Command::from_u8(command_byte).ok_or(Malformed::UnknownCommand(command_byte))?;

    let message = match command {
        Command::Registration => {
            let version = cursor.read_u16::<BigEndian>()?;
            let chain_uuid = cursor.read_u64::<BigEndian>()?;
            let last_seq = cursor.read_u64::<BigEndian>()?;
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            Message::Registration(Registration {
                version,
                chain_uuid,
                last_seq,
                round,
            })
        }
        Command::RegistrationConfirmed => Message::RegistrationConfirmed,
        Command::RegistrationRefused => {
            let reason = match cursor.read_u8()? {
                1 => RegistrationRefusalReason::BadClientVersion,
                2 => RegistrationRefusalReason::IncompatibleBlockchain,
                3 => RegistrationRefusalReason::LimitReached,
                4 => RegistrationRefusalReason::Timeout,
                other => return Err(Malformed::UnknownCommand(other)),
            };
            Message::RegistrationRefused(reason)
        }
        Command::Ping => {
            let last_seq = cursor.read_u64::<BigEndian>()?;
            Message::Ping(Ping { last_seq })
        }
        Command::BlockRequest => {
            let pack_counter = cursor.read_u32::<BigEndian>()?;
            let n = cursor.read_u32::<BigEndian>()? as usize;
            let mut sequences = Vec::with_capacity(n);
            for _ in 0..n {
                sequences.push(cursor.read_u64::<BigEndian>()?);
            }
            Message::BlockRequest(BlockRequest {
                pack_counter,
                sequences,
            })
        }
        Command::BlockReply => {
            let pack_counter = cursor.read_u32::<BigEndian>()?;
            let n = cursor.read_u32::<BigEndian>()? as usize;
            let mut blocks = Vec::with_capacity(n);
            for _ in 0..n {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let bytes = read_fixed(&mut cursor, len)?;
                let mut inner = Cursor::new(bytes);
                blocks.push(decode_block(&mut inner)?);
            }
            Message::BlockReply(BlockReply {
                pack_counter,
                blocks,
            })
        }
        Command::Stage1 => {
            let sender_idx = TrustedIndex(cursor.read_u8()?);
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let mask_hash = read_hash(&mut cursor)?;
            let n_candidates = cursor.read_u8()? as usize;
            let mut candidate_trusted = Vec::with_capacity(n_candidates);
            for _ in 0..n_candidates {
                candidate_trusted.push(read_key(&mut cursor)?);
            }
            let n_hashes = cursor.read_u8()? as usize;
            let mut candidate_hashes = Vec::with_capacity(n_hashes);
            for _ in 0..n_hashes {
                candidate_hashes.push(read_hash(&mut cursor)?);
            }
            let signature = read_sig(&mut cursor)?;
            Message::Stage1(Stage1 {
                sender_idx,
                round,
                mask_hash,
                candidate_trusted,
                candidate_hashes,
                signature,
            })
        }
        Command::Stage2 => {
            let sender_idx = TrustedIndex(cursor.read_u8()?);
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let n = cursor.read_u8()? as usize;
            let mut stage1_hashes = Vec::with_capacity(n);
            for _ in 0..n {
                stage1_hashes.push(read_hash(&mut cursor)?);
            }
            let mut signatures = Vec::with_capacity(n);
            for _ in 0..n {
                signatures.push(read_sig(&mut cursor)?);
            }
            Message::Stage2(Stage2 {
                sender_idx,
                round,
                stage1_hashes,
                signatures,
            })
        }
        Command::Stage3 => {
            let sender_idx = TrustedIndex(cursor.read_u8()?);
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let writer_idx = TrustedIndex(cursor.read_u8()?);
            let block_signature = read_sig(&mut cursor)?;
            let mask_len = cursor.read_u8()? as usize;
            let mask_bytes = read_fixed(&mut cursor, mask_len)?;
            Message::Stage3(Stage3 {
                sender_idx,
                round,
                writer_idx,
                block_signature,
                untrusted_mask: BitVec::from_bytes(&mask_bytes),
            })
        }
        Command::Stage1Request | Command::Stage2Request | Command::Stage3Request => {
            let from = TrustedIndex(cursor.read_u8()?);
            let required = TrustedIndex(cursor.read_u8()?);
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let request = StageRequest {
                from,
                required,
                round,
            };
            match command {
                Command::Stage1Request => Message::Stage1Request(request),
                Command::Stage2Request => Message::Stage2Request(request),
                _ => Message::Stage3Request(request),
            }
        }
        Command::RoundTable => {
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let starting_timestamp = cursor.read_i64::<BigEndian>()?;
            let n_confidants = cursor.read_u8()? as usize;
            let mut confidants = Vec::with_capacity(n_confidants);
            for _ in 0..n_confidants {
                confidants.push(read_key(&mut cursor)?);
            }
            let n_hashes = cursor.read_u8()? as usize;
            let mut expected_packet_hashes = Vec::with_capacity(n_hashes);
            for _ in 0..n_hashes {
                expected_packet_hashes.push(read_hash(&mut cursor)?);
            }
            Message::RoundTable(crate::block::RoundTable {
                round,
                confidants,
                expected_packet_hashes,
                starting_timestamp,
            })
        }
        Command::RoundTableRequest => {
            Message::RoundTableRequest(RoundNumber(cursor.read_u64::<BigEndian>()?))
        }
        Command::RoundTableReply => {
            // Re-synthesize a RoundTable command header so the shared decode
            // path can be reused for the nested payload.
            let mut rest = Vec::new();
            rest.write_u8(0).unwrap();
            rest.write_u8(Command::RoundTable as u8).unwrap();
            cursor.read_to_end(&mut rest)?;
            let table_msg = decode(&rest)?;
            let table = match table_msg {
                Message::RoundTable(t) => t,
                _ => unreachable!(),
            };
            Message::RoundTableReply(RoundTableReply { table })
        }
        Command::BigBang => Message::BigBang(RoundNumber(cursor.read_u64::<BigEndian>()?)),
        Command::EmptyRoundPack => {
            Message::EmptyRoundPack(RoundNumber(cursor.read_u64::<BigEndian>()?))
        }
        Command::BlockAlarm => Message::BlockAlarm(RoundNumber(cursor.read_u64::<BigEndian>()?)),
        Command::EventReport => {
            let round = RoundNumber(cursor.read_u64::<BigEndian>()?);
            let kind = cursor.read_u8()?;
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let detail = read_fixed(&mut cursor, len)?;
            Message::EventReport(EventReportMsg { round, kind, detail })
        }
        Command::BlockHash => Message::BlockHash(read_hash(&mut cursor)?),
        Command::HashReply => Message::HashReply(read_hash(&mut cursor)?),
    };

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(Malformed::LengthMismatch);
    }
    Ok(message)
}
