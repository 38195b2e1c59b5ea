// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Group operations shared by the whole engine.
//!
//! All keys live on the Ristretto prime-order group over Curve25519.
//! Long-term keys double as Diffie–Hellman identities: each (client,
//! trustee) pair derives a shared point whose canonical encoding seeds the
//! pairwise pad stream. The secret scalar is used only to derive and is
//! never stored beyond the key pair that owns it.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::{Error, Result};

pub mod schnorr;

/// Canonical encoding length of a Ristretto point.
pub const POINT_LEN: usize = 32;
/// Canonical encoding length of a scalar.
pub const SCALAR_LEN: usize = 32;

/// A (secret scalar, public point) pair.
///
/// The secret is zeroized on drop. Long-term pairs persist across
/// sessions; ephemeral pairs live for exactly one setup.
pub struct KeyPair {
    secret: Scalar,
    public: RistrettoPoint,
}

impl KeyPair {
    /// Generates a fresh pair from the supplied RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        let public = RISTRETTO_BASEPOINT_POINT * secret;
        Self { secret, public }
    }

    #[must_use]
    pub fn public(&self) -> RistrettoPoint {
        self.public
    }

    #[must_use]
    pub fn secret(&self) -> &Scalar {
        &self.secret
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.compress())
            .finish_non_exhaustive()
    }
}

/// Diffie–Hellman shared point `sk · peer_pk`.
#[must_use]
pub fn shared_secret(secret: &Scalar, peer_pk: &RistrettoPoint) -> RistrettoPoint {
    peer_pk * secret
}

/// Derives the pad-stream seed from a shared point.
///
/// Both sides of a pair marshal the same point, so the derived streams are
/// identical byte for byte.
#[must_use]
pub fn pad_seed(shared: &RistrettoPoint) -> Zeroizing<[u8; POINT_LEN]> {
    Zeroizing::new(shared.compress().to_bytes())
}

/// Hashes the concatenation of `parts` onto the scalar field (wide
/// reduction, no modular bias).
#[must_use]
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Decodes a canonical Ristretto point encoding.
pub fn decode_point(bytes: &[u8]) -> Result<RistrettoPoint> {
    let compressed = CompressedRistretto::from_slice(bytes)
        .map_err(|_| Error::Crypto(format!("point encoding must be {POINT_LEN} bytes")))?;
    compressed
        .decompress()
        .ok_or_else(|| Error::Crypto("invalid point encoding".into()))
}

/// Decodes a canonical scalar encoding.
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; SCALAR_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Crypto(format!("scalar encoding must be {SCALAR_LEN} bytes")))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(array))
        .ok_or_else(|| Error::Crypto("non-canonical scalar encoding".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn shared_secret_is_symmetric() {
        let mut rng = OsRng;
        let a = KeyPair::generate(&mut rng);
        let b = KeyPair::generate(&mut rng);
        let ab = shared_secret(a.secret(), &b.public());
        let ba = shared_secret(b.secret(), &a.public());
        assert_eq!(ab.compress(), ba.compress());
        assert_eq!(*pad_seed(&ab), *pad_seed(&ba));
    }

    #[test]
    fn point_roundtrip() {
        let mut rng = OsRng;
        let kp = KeyPair::generate(&mut rng);
        let bytes = kp.public().compress().to_bytes();
        let decoded = decode_point(&bytes).unwrap();
        assert_eq!(decoded.compress().to_bytes(), bytes);
    }

    #[test]
    fn rejects_malformed_point() {
        assert!(decode_point(&[0xffu8; POINT_LEN]).is_err());
        assert!(decode_point(&[0u8; 7]).is_err());
    }

    #[test]
    fn hash_to_scalar_is_stable() {
        let a = hash_to_scalar(&[b"veilnet", b"test"]);
        let b = hash_to_scalar(&[b"veilnet", b"test"]);
        let c = hash_to_scalar(&[b"veilnet", b"other"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
