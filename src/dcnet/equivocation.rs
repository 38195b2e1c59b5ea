// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Equivocation protection.
//!
//! Binds every decoded round to the downstream history seen so far, so a
//! relay cannot show different histories to different clients without
//! corrupting the round. Each participant folds the round's pads into a
//! blinding scalar weighted by the running history scalar; the slot owner
//! additionally blinds its payload with a fresh scalar κ and carries κ in
//! its tag. Summing client tags and subtracting trustee tags cancels all
//! pad terms — as long as everyone agrees on the history — and leaves κ
//! for the relay to unblind with.

use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use super::PadStream;
use crate::crypto::hash_to_scalar;

const HISTORY_DOMAIN: &[u8] = b"veilnet.equivocation.history.v1";
const PAD_DOMAIN: &[u8] = b"veilnet.equivocation.pad.v1";
const KEYSTREAM_DOMAIN: &[u8] = b"veilnet.equivocation.keystream.v1";

/// Per-participant equivocation state.
pub struct Equivocation {
    history: Scalar,
    randomness: PadStream,
}

impl Equivocation {
    pub(crate) fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self {
            history: hash_to_scalar(&[HISTORY_DOMAIN]),
            randomness: PadStream::new(&seed),
        }
    }

    /// Absorbs one downstream cell into the history scalar.
    pub(crate) fn update_history(&mut self, downstream: &[u8]) {
        self.history = hash_to_scalar(&[HISTORY_DOMAIN, &self.history.to_bytes(), downstream]);
    }

    fn random_scalar(&mut self) -> Scalar {
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&self.randomness.draw(64));
        Scalar::from_bytes_mod_order_wide(&wide)
    }

    /// History-weighted sum of the round's pad scalars.
    fn blinding(&self, pads: &[Vec<u8>]) -> Scalar {
        let mut sum = Scalar::ZERO;
        for pad in pads {
            sum += hash_to_scalar(&[PAD_DOMAIN, pad]);
        }
        self.history * sum
    }

    /// Client side: blinds the owner's payload in place and returns the tag.
    pub(crate) fn client_encode(
        &mut self,
        slot_owner: bool,
        payload: &mut [u8],
        pads: &[Vec<u8>],
    ) -> Scalar {
        let blind = self.blinding(pads);
        if !slot_owner {
            return blind;
        }
        let kappa = self.random_scalar();
        xor_keystream(&kappa, payload);
        kappa + blind
    }

    /// Trustee side: tag only, no payload.
    pub(crate) fn trustee_contribution(&self, pads: &[Vec<u8>]) -> Scalar {
        self.blinding(pads)
    }

    /// Relay side: recovers κ from the tags and unblinds the XOR result.
    pub(crate) fn relay_decode(
        &self,
        raw_xor: &[u8],
        client_tags: &[Scalar],
        trustee_tags: &[Scalar],
    ) -> Vec<u8> {
        let mut kappa = Scalar::ZERO;
        for tag in client_tags {
            kappa += tag;
        }
        for tag in trustee_tags {
            kappa -= tag;
        }
        let mut out = raw_xor.to_vec();
        xor_keystream(&kappa, &mut out);
        out
    }
}

fn xor_keystream(kappa: &Scalar, buf: &mut [u8]) {
    let mut xof = Shake256::default();
    xof.update(KEYSTREAM_DOMAIN);
    xof.update(&kappa.to_bytes());
    let mut reader = xof.finalize_xof();
    let mut stream = vec![0u8; buf.len()];
    reader.read(&mut stream);
    for (b, s) in buf.iter_mut().zip(&stream) {
        *b ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn keystream_is_self_inverse() {
        let kappa = Scalar::from(42u64);
        let mut buf = vec![7u8; 48];
        xor_keystream(&kappa, &mut buf);
        assert_ne!(buf, vec![7u8; 48]);
        xor_keystream(&kappa, &mut buf);
        assert_eq!(buf, vec![7u8; 48]);
    }

    #[test]
    fn tags_cancel_without_owner_blinding() {
        let mut rng = OsRng;
        // one client, one trustee, sharing a single pad
        let mut client = Equivocation::new(&mut rng);
        let mut trustee = Equivocation::new(&mut rng);
        client.update_history(b"round 0");
        trustee.update_history(b"round 0");
        let pads = vec![vec![0xabu8; 32]];
        let mut payload = vec![0u8; 32];
        let sigma = client.client_encode(false, &mut payload, &pads);
        let tau = trustee.trustee_contribution(&pads);
        assert_eq!(sigma, tau);
        assert_eq!(payload, vec![0u8; 32]);
    }

    #[test]
    fn owner_tag_carries_recoverable_kappa() {
        let mut rng = OsRng;
        let mut client = Equivocation::new(&mut rng);
        let trustee = Equivocation::new(&mut rng);
        let relay = Equivocation::new(&mut rng);
        let pads = vec![vec![0x11u8; 16]];
        let mut payload = b"owner pay".to_vec();
        payload.resize(16, 0);
        let expected = payload.clone();
        let sigma = client.client_encode(true, &mut payload, &pads);
        let tau = trustee.trustee_contribution(&pads);
        let recovered = relay.relay_decode(&payload, &[sigma], &[tau]);
        assert_eq!(recovered, expected);
    }
}
