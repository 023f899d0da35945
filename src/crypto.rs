pub mod ed25519;
pub mod schnorr;

use generic_array::{typenum::Unsigned, ArrayLength, GenericArray};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt::Debug;
use zeroize::{DefaultIsZeroes, ZeroizeOnDrop};

// Ideally, we want to use a concrete implementation (like ChaCha20) instead of StdRng
// to prevent it from potentially changing from under us
pub type Rng = rand::rngs::StdRng;

pub trait ECPoint:
	Clone
	+ Copy
	+ Debug
	+ Default
	+ DefaultIsZeroes
	+ 'static
	+ serde::Serialize
	+ for<'de> serde::Deserialize<'de>
	+ std::ops::Mul<Self::Scalar, Output = Self>
	+ for<'a> std::ops::Mul<&'a Self::Scalar, Output = Self>
	+ std::ops::Sub<Output = Self>
	+ std::ops::Add<Output = Self>
	+ std::iter::Sum
	+ PartialEq
	+ Sync
	+ Send
{
	type Scalar: ECScalar;

	type CompressedPointLength: ArrayLength + Unsigned;

	fn from_scalar(scalar: &Self::Scalar) -> Self;

	fn as_bytes(&self) -> GenericArray<u8, Self::CompressedPointLength>;

	fn point_at_infinity() -> Self;

	fn is_point_at_infinity(&self) -> bool {
		self == &Self::point_at_infinity()
	}
}

pub trait ECScalar:
	Clone
	+ Debug
	+ Sized
	+ Default
	+ serde::Serialize
	+ for<'de> serde::Deserialize<'de>
	+ for<'a> std::ops::Mul<&'a Self, Output = Self>
	+ for<'a> std::ops::Add<&'a Self, Output = Self>
	+ std::ops::Mul<Output = Self>
	+ std::ops::Add<Output = Self>
	+ std::ops::Sub<Output = Self>
	+ std::iter::Sum
	+ zeroize::Zeroize
	+ PartialEq
	+ Sync
	+ Send
	+ ZeroizeOnDrop
	+ std::convert::From<u32>
{
	fn random(rng: &mut Rng) -> Self;

	fn from_bytes_mod_order(x: &[u8; 32]) -> Self;

	/// Reduce 64 bytes of hash output into a scalar. Used when deriving
	/// challenges from SHA-512 digests.
	fn from_bytes_mod_order_wide(x: &[u8; 64]) -> Self;

	fn zero() -> Self;
}

/// A node's long-term identity key pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Keypair<P: ECPoint> {
	#[serde(bound = "")]
	pub public: P,
	#[serde(bound = "")]
	pub secret: P::Scalar,
}

impl<P: ECPoint> Keypair<P> {
	pub fn generate(rng: &mut Rng) -> Self {
		let secret = P::Scalar::random(rng);
		let public = P::from_scalar(&secret);
		Keypair { public, secret }
	}
}

/// SHA-512 digest of an arbitrary byte string (the PBFT proposal digest)
pub fn sha512(data: &[u8]) -> [u8; 64] {
	let mut digest = [0u8; 64];
	digest.copy_from_slice(&Sha512::digest(data));
	digest
}

#[cfg(test)]
mod tests {
	use super::{ed25519::Point, *};

	#[test]
	fn keypair_public_matches_secret() {
		use rand::SeedableRng;
		let mut rng = Rng::from_seed([1; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);
		assert_eq!(keypair.public, Point::from_scalar(&keypair.secret));
	}

	#[test]
	fn sha512_matches_known_vector() {
		// SHA-512 of the empty string
		assert_eq!(
			hex::encode(sha512(b"")),
			"cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
			47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
		);
	}
}
