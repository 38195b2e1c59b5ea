// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Schnorr signatures over the Ristretto group.
//!
//! Trustees sign the shuffle transcript with their long-term keys and
//! clients verify all of them before entering the communication phase.
//! The scheme is the classic (challenge, response) layout: `T = v·B`,
//! `c = H(T || msg)`, `r = v − x·c`; the verifier recomputes
//! `T' = r·B + c·P` and checks the challenge.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use super::{decode_scalar, hash_to_scalar, SCALAR_LEN};
use crate::{Error, Result};

const CHALLENGE_DOMAIN: &[u8] = b"veilnet.schnorr.v1";

/// Encoded signature length: challenge scalar followed by response scalar.
pub const SIGNATURE_LEN: usize = 2 * SCALAR_LEN;

/// A Schnorr signature `(c, r)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    c: Scalar,
    r: Scalar,
}

impl Signature {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..SCALAR_LEN].copy_from_slice(&self.c.to_bytes());
        out[SCALAR_LEN..].copy_from_slice(&self.r.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(Error::Crypto(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            c: decode_scalar(&bytes[..SCALAR_LEN])?,
            r: decode_scalar(&bytes[SCALAR_LEN..])?,
        })
    }
}

fn challenge(commitment: &RistrettoPoint, message: &[u8]) -> Scalar {
    hash_to_scalar(&[
        CHALLENGE_DOMAIN,
        commitment.compress().as_bytes(),
        message,
    ])
}

/// Signs `message` with the long-term secret scalar.
pub fn sign<R: RngCore + CryptoRng>(secret: &Scalar, message: &[u8], rng: &mut R) -> Signature {
    let mut v = Scalar::random(rng);
    let commitment = RISTRETTO_BASEPOINT_POINT * v;
    let c = challenge(&commitment, message);
    let r = v - secret * c;
    v.zeroize();
    Signature { c, r }
}

/// Verifies a signature against the signer's public point.
#[must_use]
pub fn verify(public: &RistrettoPoint, message: &[u8], sig: &Signature) -> bool {
    let commitment = RISTRETTO_BASEPOINT_POINT * sig.r + public * sig.c;
    challenge(&commitment, message) == sig.c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use rand::rngs::OsRng;

    #[test]
    fn sign_verify_roundtrip() {
        let mut rng = OsRng;
        let kp = KeyPair::generate(&mut rng);
        let sig = sign(kp.secret(), b"shuffle transcript", &mut rng);
        assert!(verify(&kp.public(), b"shuffle transcript", &sig));
    }

    #[test]
    fn rejects_wrong_message() {
        let mut rng = OsRng;
        let kp = KeyPair::generate(&mut rng);
        let sig = sign(kp.secret(), b"shuffle transcript", &mut rng);
        assert!(!verify(&kp.public(), b"another transcript", &sig));
    }

    #[test]
    fn rejects_wrong_key() {
        let mut rng = OsRng;
        let kp = KeyPair::generate(&mut rng);
        let other = KeyPair::generate(&mut rng);
        let sig = sign(kp.secret(), b"msg", &mut rng);
        assert!(!verify(&other.public(), b"msg", &sig));
    }

    #[test]
    fn encoding_roundtrip() {
        let mut rng = OsRng;
        let kp = KeyPair::generate(&mut rng);
        let sig = sign(kp.secret(), b"msg", &mut rng);
        let decoded = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, decoded);
        assert!(verify(&kp.public(), b"msg", &decoded));
    }

    #[test]
    fn rejects_truncated_encoding() {
        assert!(Signature::from_bytes(&[0u8; 63]).is_err());
    }
}
