//! The collective-signing aggregation kernel: commitment and response
//! aggregation with double-count prevention, challenge derivation and
//! threshold verification of the final signature.
//!
//! A signature `(V, r, mask)` verifies when `r·B + c·AggPk(mask) == V`
//! with `c = H512(V ‖ AggPk(mask) ‖ proposal)`, where `AggPk(mask)` is
//! the sum of the public keys selected by the mask.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

use super::cosi_data::Commitment;
use crate::{
	crypto::{ECPoint, ECScalar, Rng},
	overlay::NodeIndex,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
	#[error("mask covers {actual} positions, expected {expected}")]
	WidthMismatch { actual: usize, expected: usize },
	#[error("mask has a bit set outside the roster range")]
	BitOutOfRange,
	#[error("node {0} contributed to more than one aggregate")]
	OverlappingContribution(NodeIndex),
	#[error("{contributors} contributor(s) below the required threshold of {required}")]
	ThresholdNotMet { contributors: usize, required: usize },
	#[error("invalid collective signature")]
	InvalidSignature,
	#[error("malformed signature encoding: {0}")]
	InvalidEncoding(String),
}

/// Marks which roster positions contributed to an aggregate value,
/// one bit per position. The number of set bits always equals the
/// number of distinct contributors folded into the aggregate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipationMask {
	bits: Vec<u8>,
	positions: usize,
}

impl ParticipationMask {
	pub fn empty(positions: usize) -> Self {
		ParticipationMask { bits: vec![0; positions.div_ceil(8)], positions }
	}

	pub fn with_bit(positions: usize, index: NodeIndex) -> Result<Self, AggregateError> {
		let mut mask = Self::empty(positions);
		mask.set(index)?;
		Ok(mask)
	}

	pub fn set(&mut self, index: NodeIndex) -> Result<(), AggregateError> {
		if index as usize >= self.positions {
			return Err(AggregateError::BitOutOfRange)
		}
		self.bits[index as usize / 8] |= 1 << (index % 8);
		Ok(())
	}

	pub fn contains(&self, index: NodeIndex) -> bool {
		(index as usize) < self.positions && self.bits[index as usize / 8] & (1 << (index % 8)) != 0
	}

	/// Number of contributors marked in the mask
	pub fn count(&self) -> usize {
		self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
	}

	pub fn positions(&self) -> usize {
		self.positions
	}

	/// Contributor positions in roster order
	pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
		(0..self.positions as NodeIndex).filter(|index| self.contains(*index))
	}

	/// Fold another mask in, rejecting double-counted contributors
	pub fn merge(&mut self, other: &Self) -> Result<(), AggregateError> {
		if other.positions != self.positions {
			return Err(AggregateError::WidthMismatch {
				actual: other.positions,
				expected: self.positions,
			})
		}
		if let Some(index) = other.indices().find(|index| self.contains(*index)) {
			return Err(AggregateError::OverlappingContribution(index))
		}
		for (byte, other_byte) in self.bits.iter_mut().zip(&other.bits) {
			*byte |= other_byte;
		}
		Ok(())
	}

	/// Check a mask received off the wire against the roster size:
	/// the claimed width, the byte length and the unused trailing bits
	/// must all be consistent.
	pub fn validate(&self, positions: usize) -> Result<(), AggregateError> {
		if self.positions != positions {
			return Err(AggregateError::WidthMismatch { actual: self.positions, expected: positions })
		}
		if self.bits.len() != positions.div_ceil(8) {
			return Err(AggregateError::BitOutOfRange)
		}
		let stray = match positions % 8 {
			0 => 0,
			used => self.bits.last().copied().unwrap_or(0) >> used,
		};
		if stray != 0 {
			return Err(AggregateError::BitOutOfRange)
		}
		Ok(())
	}
}

/// Sum of the public keys selected by the mask. The mask must have
/// been validated against `publics`.
pub fn aggregate_public<P: ECPoint>(publics: &[P], mask: &ParticipationMask) -> P {
	mask.indices().map(|index| publics[index as usize]).sum()
}

/// Sample a fresh commitment secret and fold the child commitments
/// into it. Returns the secret (needed again for the response) and the
/// aggregate to send upward.
pub fn generate_commitment_and_aggregate<P: ECPoint>(
	own_index: NodeIndex,
	publics: &[P],
	child_commitments: &[Commitment<P>],
	rng: &mut Rng,
) -> Result<(P::Scalar, Commitment<P>), AggregateError> {
	let secret = P::Scalar::random(rng);

	let mut aggregate = P::from_scalar(&secret);
	let mut mask = ParticipationMask::with_bit(publics.len(), own_index)?;

	for child in child_commitments {
		child.mask.validate(publics.len())?;
		mask.merge(&child.mask)?;
		aggregate = aggregate + child.commitment;
	}

	Ok((secret, Commitment { commitment: aggregate, mask }))
}

/// The round's challenge: `H512(V ‖ AggPk(mask) ‖ proposal)` reduced
/// to a scalar
pub fn derive_challenge<P: ECPoint>(
	aggregate: &P,
	mask: &ParticipationMask,
	publics: &[P],
	proposal: &[u8],
) -> Result<P::Scalar, AggregateError> {
	mask.validate(publics.len())?;

	let hash = Sha512::new()
		.chain_update(aggregate.as_bytes())
		.chain_update(aggregate_public(publics, mask).as_bytes())
		.chain_update(proposal);

	let mut output = [0u8; 64];
	output.copy_from_slice(&hash.finalize());

	Ok(P::Scalar::from_bytes_mod_order_wide(&output))
}

/// Combine child responses with our own `r = v − c·x`. A node that
/// did not contribute a commitment secret passes `None` and forwards
/// the children's sum unchanged.
pub fn generate_response<P: ECPoint>(
	own_share: Option<(P::Scalar, P::Scalar)>,
	child_responses: Vec<P::Scalar>,
	challenge: &P::Scalar,
) -> P::Scalar {
	let own = own_share.map(|(secret, private_key)| secret - challenge.clone() * &private_key);
	child_responses.into_iter().chain(own).sum()
}

/// Accepts a mask iff it marks at least `threshold` contributors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThresholdPolicy {
	threshold: usize,
}

impl ThresholdPolicy {
	pub fn at_least(threshold: usize) -> Self {
		ThresholdPolicy { threshold }
	}

	pub fn accepts(&self, mask: &ParticipationMask) -> Result<(), AggregateError> {
		let contributors = mask.count();
		if contributors >= self.threshold {
			Ok(())
		} else {
			Err(AggregateError::ThresholdNotMet { contributors, required: self.threshold })
		}
	}
}

/// The round's final artifact
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CosiSignature<P: ECPoint> {
	#[serde(bound = "")]
	pub commitment: P,
	#[serde(bound = "")]
	pub response: P::Scalar,
	pub mask: ParticipationMask,
}

impl<P: ECPoint> CosiSignature<P> {
	pub fn to_bytes(&self) -> Vec<u8> {
		bincode::serialize(self).expect("signature serialization cannot fail")
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
		bincode::deserialize(bytes).map_err(|error| AggregateError::InvalidEncoding(error.to_string()))
	}
}

/// Verify a collective signature: the Schnorr equation under the
/// aggregate key selected by the mask, then the threshold policy.
pub fn verify<P: ECPoint>(
	publics: &[P],
	proposal: &[u8],
	signature: &CosiSignature<P>,
	policy: &ThresholdPolicy,
) -> Result<(), AggregateError> {
	let challenge = derive_challenge(&signature.commitment, &signature.mask, publics, proposal)?;
	let aggregate_key = aggregate_public(publics, &signature.mask);

	if P::from_scalar(&signature.response) + aggregate_key * challenge != signature.commitment {
		return Err(AggregateError::InvalidSignature)
	}

	policy.accepts(&signature.mask)
}
