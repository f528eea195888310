//! Cryptographic capability types.
//!
//! The primitives themselves are an assumed capability (spec §6, Non-goals):
//! this module defines the types the rest of the crate is built around and a
//! `Signer`/`Hasher` trait pair so tests can supply a deterministic fake
//! while production wires in a real backend (e.g. ed25519/blake2, as
//! `exonum::crypto` wires in sodiumoxide).

use serde_derive::{Deserialize, Serialize};
use std::fmt;

pub const HASH_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

macro_rules! fixed_size_bytes {
    ($name:ident, $size:expr) => {
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            pub fn zero() -> Self {
                $name([0; $size])
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                if slice.len() != $size {
                    return None;
                }
                let mut bytes = [0; $size];
                bytes.copy_from_slice(slice);
                Some($name(bytes))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }
    };
}

fixed_size_bytes!(Hash, HASH_SIZE);
fixed_size_bytes!(PublicKey, PUBLIC_KEY_SIZE);
fixed_size_bytes!(Signature, SIGNATURE_SIZE);

/// A node's identity is its public key; ordering and equality are by byte
/// sequence (spec §3).
pub type NodeId = PublicKey;

/// Opaque private key handle, never serialized or logged.
#[derive(Clone)]
pub struct SecretKey(pub [u8; 64]);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Collision-resistant hash capability required from collaborators (spec §6).
pub trait Hasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> Hash;
}

/// Signing/verification capability required from collaborators (spec §6).
pub trait Signer: Send + Sync {
    fn sign(&self, key: &SecretKey, bytes: &[u8]) -> Signature;
    fn verify(&self, key: &PublicKey, bytes: &[u8], signature: &Signature) -> bool;
}
