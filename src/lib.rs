//! Tree-organized collective signing and Byzantine agreement.
//!
//! Two protocol state machines run over an overlay tree: a two-tier
//! collective Schnorr signature round (announce, commit, challenge,
//! response) that aggregates partial commitments and responses into a
//! single threshold-verifiable signature, and a three-phase PBFT round
//! (pre-prepare, prepare, commit, reply) that counts signed phase
//! messages against a 2/3 + 1 quorum.

#[macro_use]
mod utils;

/// Collective signing protocol (aggregation kernel, subtree round, root round)
pub mod cosi;
/// Cryptographic primitives used by both protocols
pub mod crypto;
/// Message routing substrate and tree topology
pub mod overlay;
/// Three-phase Byzantine agreement
pub mod pbft;

#[cfg(test)]
pub(crate) mod helpers;

pub use crypto::{ECPoint, ECScalar, Keypair, Rng};
pub use overlay::{InstanceId, Network, Node, NodeId, NodeIndex, Peer, Roster, Tree};
