//! Plain Schnorr signatures over arbitrary byte strings, used to
//! authenticate protocol phase messages. The challenge binds the nonce
//! commitment, the signer's public key and the message:
//! `c = H512(R ‖ pub ‖ msg)`, `s = k + c·x`, and verification checks
//! `s·B == R + c·P`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

use super::{ECPoint, ECScalar, Keypair, Rng};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid schnorr signature")]
pub struct InvalidSignature;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SchnorrSignature<P: ECPoint> {
	#[serde(bound = "")]
	pub r: P,
	#[serde(bound = "")]
	pub s: P::Scalar,
}

fn challenge<P: ECPoint>(nonce_commitment: &P, public: &P, message: &[u8]) -> P::Scalar {
	let hash = Sha512::new()
		.chain_update(nonce_commitment.as_bytes())
		.chain_update(public.as_bytes())
		.chain_update(message);

	let mut output = [0u8; 64];
	output.copy_from_slice(&hash.finalize());

	P::Scalar::from_bytes_mod_order_wide(&output)
}

pub fn sign<P: ECPoint>(keypair: &Keypair<P>, message: &[u8], rng: &mut Rng) -> SchnorrSignature<P> {
	let nonce = P::Scalar::random(rng);
	let r = P::from_scalar(&nonce);

	let c = challenge(&r, &keypair.public, message);

	SchnorrSignature { r, s: nonce + c * &keypair.secret }
}

pub fn verify<P: ECPoint>(
	public: &P,
	message: &[u8],
	signature: &SchnorrSignature<P>,
) -> Result<(), InvalidSignature> {
	let c = challenge(&signature.r, public, message);

	if P::from_scalar(&signature.s) == signature.r + *public * c {
		Ok(())
	} else {
		Err(InvalidSignature)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::ed25519::Point;
	use rand::SeedableRng;

	#[test]
	fn sign_and_verify_roundtrip() {
		let mut rng = Rng::from_seed([7; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);

		let signature = sign(&keypair, b"phase message", &mut rng);

		assert!(verify(&keypair.public, b"phase message", &signature).is_ok());
	}

	#[test]
	fn tampered_message_is_rejected() {
		let mut rng = Rng::from_seed([7; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);

		let signature = sign(&keypair, b"phase message", &mut rng);

		assert_eq!(
			verify(&keypair.public, b"another message", &signature),
			Err(InvalidSignature)
		);
	}

	#[test]
	fn wrong_public_key_is_rejected() {
		let mut rng = Rng::from_seed([7; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);
		let other = Keypair::<Point>::generate(&mut rng);

		let signature = sign(&keypair, b"phase message", &mut rng);

		assert_eq!(verify(&other.public, b"phase message", &signature), Err(InvalidSignature));
	}

	#[test]
	fn forged_signature_is_rejected() {
		let mut rng = Rng::from_seed([7; 32]);
		let keypair = Keypair::<Point>::generate(&mut rng);

		let mut signature = sign(&keypair, b"phase message", &mut rng);
		signature.s = crate::crypto::ed25519::Scalar::random(&mut rng);

		assert_eq!(
			verify(&keypair.public, b"phase message", &signature),
			Err(InvalidSignature)
		);
	}
}
