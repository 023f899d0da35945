//! Ed25519 group arithmetic for both protocols: thin newtypes over
//! `curve25519-dalek`, exposing exactly the operations the
//! [`ECPoint`]/[`ECScalar`] contracts ask for. Both types encode to
//! 32 bytes on the wire (points in compressed Edwards form).

use curve25519_dalek::{
	constants::ED25519_BASEPOINT_POINT, edwards::EdwardsPoint, scalar::Scalar as RawScalar,
	traits::Identity,
};
use generic_array::GenericArray;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{ECPoint, ECScalar, Rng};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scalar(RawScalar);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point(EdwardsPoint);

impl ECScalar for Scalar {
	fn random(rng: &mut Rng) -> Self {
		use rand::RngCore;

		// Wide reduction of 64 fresh bytes keeps the distribution
		// over the group order uniform
		let mut bytes = [0u8; 64];
		rng.fill_bytes(&mut bytes);
		Scalar(RawScalar::from_bytes_mod_order_wide(&bytes))
	}

	fn from_bytes_mod_order(bytes: &[u8; 32]) -> Self {
		Scalar(RawScalar::from_bytes_mod_order(*bytes))
	}

	fn from_bytes_mod_order_wide(bytes: &[u8; 64]) -> Self {
		Scalar(RawScalar::from_bytes_mod_order_wide(bytes))
	}

	fn zero() -> Self {
		Scalar(RawScalar::ZERO)
	}
}

impl From<u32> for Scalar {
	fn from(value: u32) -> Self {
		Scalar(RawScalar::from(value))
	}
}

impl Default for Scalar {
	fn default() -> Self {
		Self::zero()
	}
}

impl Zeroize for Scalar {
	fn zeroize(&mut self) {
		self.0.zeroize();
	}
}

// Commitment secrets and long-term keys live in this type, so it is
// wiped whenever it goes out of scope
impl Drop for Scalar {
	fn drop(&mut self) {
		self.0.zeroize();
	}
}

impl zeroize::ZeroizeOnDrop for Scalar {}

impl std::ops::Add for Scalar {
	type Output = Scalar;

	fn add(self, rhs: Self) -> Scalar {
		Scalar(self.0 + rhs.0)
	}
}

impl std::ops::Add<&Scalar> for Scalar {
	type Output = Scalar;

	fn add(self, rhs: &Scalar) -> Scalar {
		Scalar(self.0 + rhs.0)
	}
}

impl std::ops::Sub for Scalar {
	type Output = Scalar;

	fn sub(self, rhs: Self) -> Scalar {
		Scalar(self.0 - rhs.0)
	}
}

impl std::ops::Mul for Scalar {
	type Output = Scalar;

	fn mul(self, rhs: Self) -> Scalar {
		Scalar(self.0 * rhs.0)
	}
}

impl std::ops::Mul<&Scalar> for Scalar {
	type Output = Scalar;

	fn mul(self, rhs: &Scalar) -> Scalar {
		Scalar(self.0 * rhs.0)
	}
}

impl std::iter::Sum for Scalar {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Self::zero(), |acc, scalar| acc + scalar)
	}
}

impl ECPoint for Point {
	type Scalar = Scalar;

	type CompressedPointLength = typenum::U32;

	fn from_scalar(scalar: &Self::Scalar) -> Self {
		Point(ED25519_BASEPOINT_POINT * scalar.0)
	}

	fn as_bytes(&self) -> GenericArray<u8, Self::CompressedPointLength> {
		GenericArray::from(self.0.compress().to_bytes())
	}

	fn point_at_infinity() -> Self {
		Point(EdwardsPoint::identity())
	}
}

impl Default for Point {
	fn default() -> Self {
		Self::point_at_infinity()
	}
}

impl zeroize::DefaultIsZeroes for Point {}

impl std::ops::Add for Point {
	type Output = Point;

	fn add(self, rhs: Self) -> Point {
		Point(self.0 + rhs.0)
	}
}

impl std::ops::Sub for Point {
	type Output = Point;

	fn sub(self, rhs: Self) -> Point {
		Point(self.0 - rhs.0)
	}
}

impl std::ops::Mul<Scalar> for Point {
	type Output = Point;

	fn mul(self, rhs: Scalar) -> Point {
		Point(self.0 * rhs.0)
	}
}

impl std::ops::Mul<&Scalar> for Point {
	type Output = Point;

	fn mul(self, rhs: &Scalar) -> Point {
		Point(self.0 * rhs.0)
	}
}

impl std::iter::Sum for Point {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		// The identity is the additive zero of the group
		iter.fold(Self::point_at_infinity(), |acc, point| acc + point)
	}
}
