//! Message Codec (C1): encode/decode consensus messages and block-request
//! packets to/from byte sequences (spec §4.1).

pub mod codec;
pub mod types;

pub use codec::{decode, encode, Malformed};
pub use types::*;
