use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::aggregate::ParticipationMask;
use crate::{crypto::ECPoint, overlay::Stop};

/// Opens a round: carries everything a subtree node needs to
/// participate. Forwarded unchanged down the tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Announcement<P: ECPoint> {
	pub proposal: Vec<u8>,
	#[serde(bound = "")]
	pub publics: Vec<P>,
	pub subleader_timeout: Duration,
	pub leaves_timeout: Duration,
}

/// An aggregated commitment on its way up the tree. The mask records
/// which roster positions are folded into the point.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Commitment<P: ECPoint> {
	#[serde(bound = "")]
	pub commitment: P,
	pub mask: ParticipationMask,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Challenge<P: ECPoint> {
	#[serde(bound = "")]
	pub challenge: P::Scalar,
}

/// An aggregated response on its way up the tree
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Response<P: ECPoint> {
	#[serde(bound = "")]
	pub response: P::Scalar,
}

derive_display_as_type_name!(Announcement<P: ECPoint>);
derive_display_as_type_name!(Commitment<P: ECPoint>);
derive_display_as_type_name!(Challenge<P: ECPoint>);
derive_display_as_type_name!(Response<P: ECPoint>);

/// Data sent between tree nodes during a collective-signing round
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum CosiData<P: ECPoint> {
	#[serde(bound = "")]
	Announcement(Announcement<P>),
	#[serde(bound = "")]
	Commitment(Commitment<P>),
	#[serde(bound = "")]
	Challenge(Challenge<P>),
	#[serde(bound = "")]
	Response(Response<P>),
	Stop(Stop),
}

impl<P: ECPoint> std::fmt::Display for CosiData<P> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = match self {
			CosiData::Announcement(inner) => inner.to_string(),
			CosiData::Commitment(inner) => inner.to_string(),
			CosiData::Challenge(inner) => inner.to_string(),
			CosiData::Response(inner) => inner.to_string(),
			CosiData::Stop(inner) => inner.to_string(),
		};
		write!(f, "CosiData({inner})")
	}
}

derive_impls_for_enum_variants!(impl<P: ECPoint> for Announcement<P>, CosiData::Announcement, CosiData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Commitment<P>, CosiData::Commitment, CosiData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Challenge<P>, CosiData::Challenge, CosiData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Response<P>, CosiData::Response, CosiData<P>);
derive_impls_for_enum_variants!(impl<P: ECPoint> for Stop, CosiData::Stop, CosiData<P>);
