//! Round-based BFT consensus and block-synchronization core for a
//! permissioned node.
//!
//! This crate implements the protocol-level state machines only: the
//! transport, persistent block/wallet stores, and RPC façade are external
//! collaborators reached through the traits in [`block`] and [`crypto`].
//! See each module's doc comment for the component it implements.

pub mod block;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod helpers;
pub mod messages;
pub mod neighbor_registry;
pub mod pool_sync;
pub mod round_controller;
pub mod stage_store;
pub mod validator;

pub use config::ConsensusConfig;
pub use error::{ChainAppendError, CoreError, EventReport};
pub use helpers::{quorum_threshold, Milliseconds, RoundNumber, Sequence, TrustedIndex};
