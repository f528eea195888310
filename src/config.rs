//! Configuration options recognized by the core (spec §6). Modeled on
//! `exonum`'s `node::config::ConsensusConfig`: a plain `serde`-deserializable
//! struct the embedding binary parses (out of scope here) and hands in.

use crate::helpers::Milliseconds;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// Minimum confidant set size for a round to form.
    pub min_trusted_nodes: usize,
    /// Upper bound on confidant set size.
    pub max_trusted_nodes: usize,
    /// Per-state time budget.
    pub default_state_timeout: Milliseconds,
    /// Lag threshold (in sequences) to start block sync.
    pub round_different: u64,
    /// Sync window size (sequences requested in parallel).
    pub max_block_count: usize,
    /// Rounds before a sync request is re-issued.
    pub max_wait_round: u32,
    /// Unrelated replies before a sync request is re-issued.
    pub max_wait_reply: u32,
    /// Peer idle eviction timeout.
    pub last_seen_timeout: Milliseconds,
    /// Round-lookahead tolerance for packet-type messages.
    pub meta_capacity: u64,
    /// Delay before re-requesting a missing stage message.
    pub stage_request_delay: Milliseconds,
    /// Bound on the peer registry.
    pub max_neighbours: usize,
    /// Max candidate trusted nodes / packet hashes a Stage-1 may carry.
    pub max_candidate_hashes: usize,
    /// Max confidants in a round table.
    pub max_round_table_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            min_trusted_nodes: 4,
            max_trusted_nodes: 100,
            default_state_timeout: 5_000,
            round_different: 2,
            max_block_count: 25,
            max_wait_round: 4,
            max_wait_reply: 6,
            last_seen_timeout: 30_000,
            meta_capacity: 10,
            stage_request_delay: 400,
            max_neighbours: 128,
            max_candidate_hashes: 25,
            max_round_table_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = ConsensusConfig::default();
        assert_eq!(cfg.min_trusted_nodes, 4);
        assert_eq!(cfg.max_trusted_nodes, 100);
        assert_eq!(cfg.default_state_timeout, 5_000);
        assert_eq!(cfg.round_different, 2);
        assert_eq!(cfg.max_block_count, 25);
        assert_eq!(cfg.max_wait_round, 4);
        assert_eq!(cfg.max_wait_reply, 6);
        assert_eq!(cfg.last_seen_timeout, 30_000);
        assert_eq!(cfg.max_neighbours, 128);
    }
}
