//! Data model types shared by the Round Controller and Pool Synchronizer
//! (spec §3). Modeled on `exonum::blockchain::Block`, generalized to the
//! confidant-signature and characteristic-mask shape this consensus needs.

use crate::crypto::{Hash, PublicKey, Signature};
use crate::helpers::{RoundNumber, Sequence, TrustedIndex};
use bit_vec::BitVec;
use std::collections::HashMap;

/// A single transaction, signed by `source` over `canonical_bytes()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub source: PublicKey,
    pub target: PublicKey,
    pub inner_id: u64,
    pub max_fee: u64,
    pub counted_fee: u64,
    pub is_new_state: bool,
    pub is_deploy: bool,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl Transaction {
    /// Bytes the sender signs. Deliberately excludes `signature` itself.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.payload.len());
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&self.inner_id.to_be_bytes());
        out.extend_from_slice(&self.max_fee.to_be_bytes());
        out.extend_from_slice(&self.counted_fee.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Unordered bag of transactions sharing a single hash over canonical
/// encoding. The unit of gossip (spec §3).
#[derive(Debug, Clone)]
pub struct TransactionPacket {
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

/// A per-transaction inclusion bitstring: `1` means included in the block,
/// `0` means rejected. Bit-parallel to the concatenated transaction list.
pub type CharacteristicMask = BitVec;

/// Ordered list of up to `M` confidants plus the expected packet hashes for
/// round `R`, produced by the writer of round `R - 1`.
#[derive(Debug, Clone)]
pub struct RoundTable {
    pub round: RoundNumber,
    pub confidants: Vec<PublicKey>,
    pub expected_packet_hashes: Vec<Hash>,
    pub starting_timestamp: i64,
}

impl RoundTable {
    pub fn trusted_index_of(&self, key: &PublicKey) -> Option<TrustedIndex> {
        self.confidants
            .iter()
            .position(|k| k == key)
            .map(|idx| TrustedIndex(idx as u8))
    }

    pub fn confidant_count(&self) -> usize {
        self.confidants.len()
    }
}

/// A committed block (spec §3). Sequence equals chain length at commit time.
#[derive(Debug, Clone)]
pub struct Block {
    pub sequence: Sequence,
    pub previous_hash: Hash,
    pub writer_key: PublicKey,
    pub transactions: Vec<Transaction>,
    pub signatures: Vec<(PublicKey, Signature)>,
    pub round_timestamp: i64,
}

impl Block {
    /// Digest signed by confidants: sequence, previous hash, writer key and
    /// the transaction list, but not the signature set itself.
    pub fn digest(&self, hasher: &dyn crate::crypto::Hasher) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.sequence.0.to_be_bytes());
        buf.extend_from_slice(self.previous_hash.as_bytes());
        buf.extend_from_slice(self.writer_key.as_bytes());
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.canonical_bytes());
        }
        hasher.hash(&buf)
    }

    pub fn distinct_valid_signature_count(
        &self,
        hasher: &dyn crate::crypto::Hasher,
        signer: &dyn crate::crypto::Signer,
    ) -> usize {
        let digest = self.digest(hasher);
        let mut seen = HashMap::new();
        for (key, sig) in &self.signatures {
            if signer.verify(key, digest.as_bytes(), sig) {
                seen.insert(*key, ());
            }
        }
        seen.len()
    }
}

/// Chain read access required from the collaborator store (spec §6).
pub trait ChainReader: Send + Sync {
    fn last_sequence(&self) -> Sequence;
    fn last_hash(&self) -> Hash;
    fn block_at(&self, sequence: Sequence) -> Option<Block>;
}

/// Chain mutation required from the collaborator store (spec §6).
pub trait ChainAppender: Send + Sync {
    fn append(&self, block: Block) -> Result<(), crate::error::ChainAppendError>;
}

/// Pending-packet-hash source required by the Round Controller's Stage-1
/// production (spec §4.5): supplies packet hashes the node has seen gossiped
/// but that no round table has referenced yet, for proposal as the next
/// round's `candidate_hashes`.
pub trait PendingPackets: Send + Sync {
    /// Up to `limit` pending packet hashes not present in `exclude`.
    fn pending_hashes(&self, exclude: &[Hash], limit: usize) -> Vec<Hash>;
}

/// Wallet snapshot capability required by the Transaction Validator (spec §6).
pub trait WalletSnapshot: Send + Sync {
    fn find_by_id(&self, wallet_id: u64) -> Option<PublicKey>;
    fn is_known_contract(&self, address: &PublicKey) -> bool;
    fn is_contract_closed(&self, address: &PublicKey) -> bool;
    fn derive_contract_address(&self, deployer: &PublicKey, inner_id: u64, payload: &[u8]) -> PublicKey;
    fn find_init_transaction(&self, contract: &PublicKey, sequence: Sequence) -> Option<Transaction>;
    fn disabled_inner_ids(&self, source: &PublicKey) -> &[u64];
}
