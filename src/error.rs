//! Error taxonomy (spec §7) plus the `?`-propagating error types for
//! fallible boundary operations (codec, chain append, config).

use crate::helpers::Sequence;
use thiserror::Error;

/// Closed taxonomy of events surfaced as `EventReport` entries. This is
/// data attached to a dropped message or rejected transaction, not a
/// `std::error::Error` used for control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReport {
    WrongSignature,
    InsufficientMaxFee,
    NegativeResult,
    SourceIsTarget,
    DisabledInnerId,
    DuplicatedInnerId,
    MalformedContractAddress,
    MalformedTransaction,
    ContractClosed,
    NewStateOutOfFee,
    EmittedOutOfFee,
    CompleteReject,
    RoundStateExpired { missing: Vec<u8> },
    Equivocation { sender: u8, stage: u8 },
    NonContiguousBlock { sequence: Sequence },
    ForkDetected { divergent_at: Sequence },
}

impl std::fmt::Display for EventReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reasons a `Registration` request can be refused (wire format `u8`, spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationRefusalReason {
    BadClientVersion = 1,
    IncompatibleBlockchain = 2,
    LimitReached = 3,
    Timeout = 4,
}

/// Errors from the chain-append boundary (spec §6 capabilities).
#[derive(Debug, Error)]
pub enum ChainAppendError {
    #[error("block sequence is not contiguous with the current tip")]
    NonContiguous,
    #[error("block does not carry enough valid confidant signatures")]
    InvalidSignatures,
    #[error("a block with this sequence has already been appended")]
    DuplicateSequence,
}

/// Top-level fallible-boundary error used with `?` across the crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("chain append failed: {0}")]
    ChainAppend(#[from] ChainAppendError),
    #[error("configuration error: {0}")]
    Config(String),
}
