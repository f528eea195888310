//! Common widely used typedefs, modeled on `exonum`'s `helpers::types` module.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Number of milliseconds.
pub type Milliseconds = u64;

/// Monotonically increasing round number. Never wraps (64-bit).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundNumber(pub u64);

impl RoundNumber {
    pub fn zero() -> Self {
        RoundNumber(0)
    }

    pub fn next(self) -> Self {
        RoundNumber(self.0 + 1)
    }
}

impl fmt::Display for RoundNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chain sequence number (block height). Sequence is dense: block `k` exists
/// only if block `k - 1` exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn zero() -> Self {
        Sequence(0)
    }

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn previous(self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else {
            Some(Sequence(self.0 - 1))
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a node within a round table's confidant list (its "trusted index").
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrustedIndex(pub u8);

impl TrustedIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TrustedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the quorum threshold `floor(n / 2) + 1` for a confidant set of
/// size `n`, used throughout the Stage Store and Round Controller.
pub fn quorum_threshold(n: usize) -> usize {
    n / 2 + 1
}
