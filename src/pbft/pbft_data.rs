use serde::{Deserialize, Serialize};

use super::PbftPhase;
use crate::{
	crypto::{schnorr::SchnorrSignature, ECPoint},
	overlay::{NodeIndex, Stop},
};

/// Opens the round: the leader's proposal, its digest and the
/// leader's signature over the proposal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PrePrepare<P: ECPoint> {
	pub msg: Vec<u8>,
	pub digest: Vec<u8>,
	#[serde(bound = "")]
	pub sig: SchnorrSignature<P>,
	pub sender: NodeIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Prepare<P: ECPoint> {
	pub digest: Vec<u8>,
	#[serde(bound = "")]
	pub sig: SchnorrSignature<P>,
	pub sender: NodeIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Commit<P: ECPoint> {
	pub digest: Vec<u8>,
	#[serde(bound = "")]
	pub sig: SchnorrSignature<P>,
	pub sender: NodeIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Reply<P: ECPoint> {
	pub result: Vec<u8>,
	#[serde(bound = "")]
	pub sig: SchnorrSignature<P>,
	pub sender: NodeIndex,
}

derive_display_as_type_name!(PrePrepare<P: ECPoint>);
derive_display_as_type_name!(Prepare<P: ECPoint>);
derive_display_as_type_name!(Commit<P: ECPoint>);
derive_display_as_type_name!(Reply<P: ECPoint>);

/// Data sent between tree nodes during an agreement round
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum PbftData<P: ECPoint> {
	#[serde(bound = "")]
	PrePrepare(PrePrepare<P>),
	#[serde(bound = "")]
	Prepare(Prepare<P>),
	#[serde(bound = "")]
	Commit(Commit<P>),
	#[serde(bound = "")]
	Reply(Reply<P>),
	Stop(Stop),
}

impl<P: ECPoint> std::fmt::Display for PbftData<P> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = match self {
			PbftData::PrePrepare(inner) => inner.to_string(),
			PbftData::Prepare(inner) => inner.to_string(),
			PbftData::Commit(inner) => inner.to_string(),
			PbftData::Reply(inner) => inner.to_string(),
			PbftData::Stop(inner) => inner.to_string(),
		};
		write!(f, "PbftData({inner})")
	}
}

derive_impls_for_enum_variants!(impl<P: ECPoint> for PrePrepare<P>, PbftData::PrePrepare, PbftData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Prepare<P>, PbftData::Prepare, PbftData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Commit<P>, PbftData::Commit, PbftData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Reply<P>, PbftData::Reply, PbftData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Stop, PbftData::Stop, PbftData<P>);

/// A quorum-counted phase message: who signed, over which digest
pub(crate) trait SignedPhaseMessage<P: ECPoint> {
	const PHASE: PbftPhase;

	fn sender(&self) -> NodeIndex;
	fn digest(&self) -> &[u8];
	fn signature(&self) -> &SchnorrSignature<P>;
}

impl<P: ECPoint> SignedPhaseMessage<P> for Prepare<P> {
	const PHASE: PbftPhase = PbftPhase::Prepare;

	fn sender(&self) -> NodeIndex {
		self.sender
	}

	fn digest(&self) -> &[u8] {
		&self.digest
	}

	fn signature(&self) -> &SchnorrSignature<P> {
		&self.sig
	}
}

impl<P: ECPoint> SignedPhaseMessage<P> for Commit<P> {
	const PHASE: PbftPhase = PbftPhase::Commit;

	fn sender(&self) -> NodeIndex {
		self.sender
	}

	fn digest(&self) -> &[u8] {
		&self.digest
	}

	fn signature(&self) -> &SchnorrSignature<P> {
		&self.sig
	}
}

impl<P: ECPoint> SignedPhaseMessage<P> for Reply<P> {
	const PHASE: PbftPhase = PbftPhase::Reply;

	fn sender(&self) -> NodeIndex {
		self.sender
	}

	fn digest(&self) -> &[u8] {
		&self.result
	}

	fn signature(&self) -> &SchnorrSignature<P> {
		&self.sig
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{ed25519::Point, schnorr, Keypair, Rng};
	use rand::SeedableRng;

	#[test]
	fn wire_roundtrip_preserves_messages() {
		let mut rng = Rng::from_seed([2; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);

		let digest = crate::crypto::sha512(b"proposal").to_vec();
		let sig = schnorr::sign(&keypair, &digest, &mut rng);

		let data = PbftData::Prepare(Prepare { digest, sig, sender: 3 });
		let bytes = bincode::serialize(&data).unwrap();
		assert_eq!(bincode::deserialize::<PbftData<Point>>(&bytes).unwrap(), data);
	}

	#[test]
	fn variants_convert_to_and_from_the_enum() {
		let data: PbftData<Point> = Stop.into();
		assert!(matches!(data, PbftData::Stop(_)));
		assert!(Commit::<Point>::try_from(data).is_err());
	}
}
