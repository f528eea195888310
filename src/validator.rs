//! Transaction Validator (C3): pure validation of a transaction batch
//! against a wallet snapshot, producing an inclusion bitmask (spec §4.3).
//! The per-transaction check order and the graph/cascade passes mirror
//! `exonum::blockchain::Transaction::verify`/`execute`'s pure-function
//! contract, with the fee and contract-lifecycle checks grounded on
//! `original_source/api/src/APIHandler.cpp`'s transaction-acceptance path.

use crate::block::{Transaction, TransactionPacket, WalletSnapshot};
use crate::crypto::{Hash, Signer};
use crate::error::EventReport;
use bit_vec::BitVec;
use std::collections::{HashMap, HashSet};

/// Result of validating one packet: the characteristic mask (spec
/// invariant P3: `len(mask) == len(input)` always) plus the rejection
/// reason for every zero bit, in input order.
pub struct ValidationResult {
    pub mask: BitVec,
    pub rejections: Vec<(usize, EventReport)>,
}

/// Pure function over a wallet-state snapshot (spec §4.3). Running this
/// twice on the same `(packet, snapshot)` yields identical masks (law L1) —
/// nothing here consults wall-clock time or external mutable state.
pub fn validate_packet(
    packet: &TransactionPacket,
    wallets: &dyn WalletSnapshot,
    signer: &dyn Signer,
    current_sequence: crate::helpers::Sequence,
) -> ValidationResult {
    let txs = &packet.transactions;
    let mut mask = BitVec::from_elem(txs.len(), true);
    let mut rejections = Vec::new();
    let mut seen_inner_ids: HashMap<crate::crypto::PublicKey, HashSet<u64>> = HashMap::new();

    for (i, tx) in txs.iter().enumerate() {
        if let Some(reason) = check_one(tx, wallets, signer, current_sequence, &mut seen_inner_ids) {
            mask.set(i, false);
            rejections.push((i, reason));
        }
    }

    cascade_contract_rejections(txs, &mut mask, &mut rejections);
    graph_pass(txs, &mut mask);

    debug_assert_eq!(mask.len(), txs.len(), "mask length must equal input length");
    ValidationResult { mask, rejections }
}

fn check_one(
    tx: &Transaction,
    wallets: &dyn WalletSnapshot,
    signer: &dyn Signer,
    current_sequence: crate::helpers::Sequence,
    seen_inner_ids: &mut HashMap<crate::crypto::PublicKey, HashSet<u64>>,
) -> Option<EventReport> {
    // 1. Signature verifies under source's public key.
    if !signer.verify(&tx.source, &tx.canonical_bytes(), &tx.signature) {
        return Some(EventReport::WrongSignature);
    }

    // 2. max_fee >= counted_fee.
    if tx.max_fee < tx.counted_fee {
        return Some(EventReport::InsufficientMaxFee);
    }

    // 3. source != target unless this is a smart-contract new-state.
    if tx.source == tx.target && !tx.is_new_state {
        return Some(EventReport::SourceIsTarget);
    }

    // 4. inner-id not disabled, not duplicated for this source in this packet.
    if wallets.disabled_inner_ids(&tx.source).contains(&tx.inner_id) {
        return Some(EventReport::DisabledInnerId);
    }
    let ids = seen_inner_ids.entry(tx.source).or_insert_with(HashSet::new);
    if !ids.insert(tx.inner_id) {
        return Some(EventReport::DuplicatedInnerId);
    }

    // 5. Closed contract.
    if wallets.is_known_contract(&tx.source) && wallets.is_contract_closed(&tx.source) {
        return Some(EventReport::ContractClosed);
    }

    // 6. New-state: the init transaction must exist with enough remaining budget.
    if tx.is_new_state {
        match wallets.find_init_transaction(&tx.target, current_sequence) {
            None => return Some(EventReport::MalformedTransaction),
            Some(init) => {
                if init.max_fee < init.counted_fee + tx.counted_fee {
                    return Some(EventReport::NewStateOutOfFee);
                }
            }
        }
    }

    // 7. Deploy: target must equal the derived contract address.
    if tx.is_deploy {
        let expected = wallets.derive_contract_address(&tx.source, tx.inner_id, &tx.payload);
        if tx.target != expected {
            return Some(EventReport::MalformedContractAddress);
        }
    }

    None
}

/// Smart-contract rejection cascade (spec §4.5 edge cases): if any
/// transaction emitted by a contract address is rejected, every
/// transaction from that address in the batch is force-rejected before
/// mask finalization.
fn cascade_contract_rejections(
    txs: &[Transaction],
    mask: &mut BitVec,
    rejections: &mut Vec<(usize, EventReport)>,
) {
    let rejected_sources: HashSet<crate::crypto::PublicKey> = rejections
        .iter()
        .map(|(i, _)| txs[*i].source)
        .collect();
    if rejected_sources.is_empty() {
        return;
    }
    let mut already_rejected: HashSet<usize> = rejections.iter().map(|(i, _)| *i).collect();
    for (i, tx) in txs.iter().enumerate() {
        if rejected_sources.contains(&tx.source) && !already_rejected.contains(&i) {
            mask.set(i, false);
            rejections.push((i, EventReport::EmittedOutOfFee));
            already_rejected.insert(i);
        }
    }
}

/// Graph pass: rejects transactions whose inputs are consumed by
/// already-rejected transactions of the same source (no double-spend
/// within the batch). Modeled as: once a source has any rejected
/// transaction, later same-source transactions that re-reference the same
/// `inner_id` budget are also rejected — duplicate `inner_id` is already
/// caught by `check_one`, so this pass only handles the spend-ordering case
/// where a later transaction's `max_fee` accounting depended on an earlier,
/// now-rejected sibling.
fn graph_pass(txs: &[Transaction], mask: &mut BitVec) {
    let mut spent_by_source: HashMap<crate::crypto::PublicKey, u64> = HashMap::new();
    for (i, tx) in txs.iter().enumerate() {
        if !mask.get(i).unwrap() {
            continue;
        }
        let spent = spent_by_source.entry(tx.source).or_insert(0);
        if *spent + tx.counted_fee > tx.max_fee {
            mask.set(i, false);
            continue;
        }
        *spent += tx.counted_fee;
    }
}

/// `hash(empty) := hash(round_number_le_bytes)` (spec §4.5 edge cases).
pub fn empty_mask_hash(round: crate::helpers::RoundNumber, hasher: &dyn crate::crypto::Hasher) -> Hash {
    hasher.hash(&round.0.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fake::{keypair, FakeCrypto};
    use crate::helpers::{RoundNumber, Sequence};
    use proptest::prelude::*;

    struct EmptyWallets;
    impl WalletSnapshot for EmptyWallets {
        fn find_by_id(&self, _wallet_id: u64) -> Option<crate::crypto::PublicKey> {
            None
        }
        fn is_known_contract(&self, _address: &crate::crypto::PublicKey) -> bool {
            false
        }
        fn is_contract_closed(&self, _address: &crate::crypto::PublicKey) -> bool {
            false
        }
        fn derive_contract_address(
            &self,
            _deployer: &crate::crypto::PublicKey,
            _inner_id: u64,
            _payload: &[u8],
        ) -> crate::crypto::PublicKey {
            crate::crypto::PublicKey::zero()
        }
        fn find_init_transaction(
            &self,
            _contract: &crate::crypto::PublicKey,
            _sequence: Sequence,
        ) -> Option<Transaction> {
            None
        }
        fn disabled_inner_ids(&self, _source: &crate::crypto::PublicKey) -> &[u64] {
            &[]
        }
    }

    fn make_tx(
        source_key: &(crate::crypto::PublicKey, crate::crypto::SecretKey),
        target: crate::crypto::PublicKey,
        inner_id: u64,
    ) -> Transaction {
        let mut tx = Transaction {
            source: source_key.0,
            target,
            inner_id,
            max_fee: 100,
            counted_fee: 10,
            is_new_state: false,
            is_deploy: false,
            payload: vec![],
            signature: crate::crypto::Signature::zero(),
        };
        tx.signature = FakeCrypto.sign(&source_key.1, &tx.canonical_bytes());
        tx
    }

    #[test]
    fn mask_length_matches_input_length() {
        let a = keypair(1);
        let b = keypair(2);
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![
                make_tx(&a, b.0, 1),
                make_tx(&b, a.0, 2),
                make_tx(&a, b.0, 3),
            ],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert_eq!(result.mask.len(), packet.transactions.len());
    }

    #[test]
    fn duplicate_inner_id_is_rejected() {
        // S4: packet [t1, t2, t1] -> mask[2] == 0, reason DuplicatedInnerID.
        let a = keypair(1);
        let b = keypair(2);
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![
                make_tx(&a, b.0, 1),
                make_tx(&a, b.0, 2),
                make_tx(&a, b.0, 1),
            ],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert_eq!(result.mask.len(), 3);
        assert!(result.mask.get(0).unwrap());
        assert!(result.mask.get(1).unwrap());
        assert!(!result.mask.get(2).unwrap());
        assert!(result
            .rejections
            .iter()
            .any(|(i, r)| *i == 2 && *r == EventReport::DuplicatedInnerId));
    }

    #[test]
    fn source_equal_target_rejected_unless_new_state() {
        let a = keypair(1);
        let mut tx = make_tx(&a, a.0, 1);
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![tx.clone()],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert!(!result.mask.get(0).unwrap());

        tx.is_new_state = true;
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![tx],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        // new-state still requires a resolvable init transaction, absent here.
        assert!(!result.mask.get(0).unwrap());
    }

    #[test]
    fn insufficient_max_fee_rejected() {
        let a = keypair(1);
        let b = keypair(2);
        let mut tx = make_tx(&a, b.0, 1);
        tx.max_fee = 1;
        tx.counted_fee = 10;
        tx.signature = FakeCrypto.sign(&a.1, &tx.canonical_bytes());
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![tx],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert!(!result.mask.get(0).unwrap());
        assert_eq!(result.rejections[0].1, EventReport::InsufficientMaxFee);
    }

    #[test]
    fn validation_is_idempotent() {
        // Law L1: running the validator twice on the same input is identical.
        let a = keypair(1);
        let b = keypair(2);
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![make_tx(&a, b.0, 1), make_tx(&b, a.0, 2)],
        };
        let r1 = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        let r2 = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert_eq!(r1.mask, r2.mask);
    }

    #[test]
    fn forged_signature_is_rejected() {
        let a = keypair(1);
        let b = keypair(2);
        let mut tx = make_tx(&a, b.0, 1);
        tx.signature = FakeCrypto.sign(&b.1, &tx.canonical_bytes());
        let packet = TransactionPacket {
            hash: Hash::zero(),
            transactions: vec![tx],
        };
        let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
        assert!(!result.mask.get(0).unwrap());
        assert_eq!(result.rejections[0].1, EventReport::WrongSignature);
    }

    #[test]
    fn empty_packet_hash_is_round_number() {
        let round = RoundNumber(42);
        let expected = FakeCrypto.hash(&round.0.to_le_bytes());
        assert_eq!(empty_mask_hash(round, &FakeCrypto), expected);
    }

    proptest! {
        /// P3: `len(mask) == len(input)` regardless of how many distinct
        /// sources or duplicated inner ids a batch contains.
        #[test]
        fn mask_length_always_equals_packet_length(
            source_count in 1usize..5,
            inner_ids in proptest::collection::vec(0u64..4, 1..12),
        ) {
            let sources: Vec<_> = (0..source_count as u8).map(|i| keypair(i + 1)).collect();
            let (target, _) = keypair(200);
            let transactions: Vec<Transaction> = inner_ids
                .iter()
                .enumerate()
                .map(|(i, id)| make_tx(&sources[i % sources.len()], target, *id))
                .collect();
            let len = transactions.len();
            let packet = TransactionPacket { hash: Hash::zero(), transactions };
            let result = validate_packet(&packet, &EmptyWallets, &FakeCrypto, Sequence(1));
            prop_assert_eq!(result.mask.len(), len);
        }
    }
}
