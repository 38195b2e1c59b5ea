// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Per-entity DC-net cipher.
//!
//! Every client/trustee pair shares a Diffie–Hellman point; its canonical
//! encoding seeds a Shake256 pad stream consumed in lock-step by both
//! sides, exactly L bytes per round. A client XORs all of its trustee pads
//! into the (possibly empty) payload; a trustee XORs all of its client
//! pads into a zero buffer. XOR-combining all N+T cells therefore cancels
//! every pad and leaves the slot owner's payload.
//!
//! The consumed pad offset advances with `current_round`: encoding for a
//! future round fast-forwards by discarding whole-round chunks, encoding
//! for a past round is a fatal programming error. For blame-style replay
//! of an earlier round, [`DcNetCodec::replay_pads`] rebuilds the streams
//! from their seeds without touching the canonical state.

use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake256, Shake256Reader};
use zeroize::Zeroizing;

use crate::crypto::{decode_scalar, SCALAR_LEN};
use crate::{Error, Result, RoundId};

mod equivocation;

pub use equivocation::Equivocation;

/// Marshal size of the equivocation tag (one group scalar).
pub const EQUIVOCATION_TAG_LEN: usize = SCALAR_LEN;

/// Payload bytes reserved from the slot owner when equivocation
/// protection is on.
pub const EQUIVOCATION_OWNER_RESERVED: usize = 16;

/// Deterministic XOF byte stream derived from a pad seed.
pub(crate) struct PadStream {
    reader: Shake256Reader,
}

impl PadStream {
    pub(crate) fn new(seed: &[u8]) -> Self {
        let mut xof = Shake256::default();
        xof.update(seed);
        Self {
            reader: xof.finalize_xof(),
        }
    }

    /// Draws the next `n` bytes of the stream.
    pub(crate) fn draw(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.reader.read(&mut out);
        out
    }

    /// Consumes and discards `n` bytes.
    pub(crate) fn skip(&mut self, n: usize) {
        let mut sink = [0u8; 256];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(sink.len());
            self.reader.read(&mut sink[..chunk]);
            remaining -= chunk;
        }
    }
}

/// Which side of the DC-net this codec encodes for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecRole {
    Client,
    Trustee,
    /// The relay holds no pads; it only decodes.
    Relay,
}

/// One DC-net cell: `payload (L bytes) || equivocation tag (0 or 32 bytes)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcNetCipher {
    pub payload: Vec<u8>,
    pub tag: Option<Scalar>,
}

impl DcNetCipher {
    /// Wire length of a cell for the given session parameters.
    #[must_use]
    pub fn wire_len(payload_size: usize, equivocation: bool) -> usize {
        payload_size + if equivocation { EQUIVOCATION_TAG_LEN } else { 0 }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.payload.clone();
        if let Some(tag) = &self.tag {
            out.extend_from_slice(&tag.to_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], payload_size: usize, equivocation: bool) -> Result<Self> {
        let expected = Self::wire_len(payload_size, equivocation);
        if bytes.len() != expected {
            return Err(Error::Crypto(format!(
                "cipher must be {expected} bytes, got {}",
                bytes.len()
            )));
        }
        let tag = if equivocation {
            Some(decode_scalar(&bytes[payload_size..])?)
        } else {
            None
        };
        Ok(Self {
            payload: bytes[..payload_size].to_vec(),
            tag,
        })
    }
}

struct RoundDecoder {
    round: RoundId,
    xor: Vec<u8>,
    client_tags: Vec<Scalar>,
    trustee_tags: Vec<Scalar>,
}

/// DC-net encoder/decoder owned by exactly one participant.
pub struct DcNetCodec {
    role: CodecRole,
    payload_size: usize,
    seeds: Vec<Zeroizing<[u8; 32]>>,
    streams: Vec<PadStream>,
    current_round: RoundId,
    equivocation: Option<Equivocation>,
    decoder: Option<RoundDecoder>,
}

impl DcNetCodec {
    /// Builds a codec from the per-peer pad seeds.
    ///
    /// Clients pass one seed per trustee, trustees one per client, the
    /// relay none.
    pub fn new<R: RngCore + CryptoRng>(
        role: CodecRole,
        payload_size: usize,
        equivocation_enabled: bool,
        seeds: Vec<Zeroizing<[u8; 32]>>,
        rng: &mut R,
    ) -> Result<Self> {
        if payload_size == 0 {
            return Err(Error::Config("payload size must be non-zero".into()));
        }
        if role == CodecRole::Relay && !seeds.is_empty() {
            return Err(Error::Config("relay codec carries no pad seeds".into()));
        }
        let streams = seeds.iter().map(|s| PadStream::new(&s[..])).collect();
        let equivocation = equivocation_enabled.then(|| Equivocation::new(rng));
        Ok(Self {
            role,
            payload_size,
            seeds,
            streams,
            current_round: 0,
            equivocation,
            decoder: None,
        })
    }

    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    #[must_use]
    pub fn equivocation_enabled(&self) -> bool {
        self.equivocation.is_some()
    }

    #[must_use]
    pub fn current_round(&self) -> RoundId {
        self.current_round
    }

    /// Maximum payload a client may embed this round.
    ///
    /// The slot owner loses a reserved margin when equivocation
    /// protection is on.
    #[must_use]
    pub fn client_capacity(&self, slot_owner: bool) -> usize {
        if slot_owner && self.equivocation.is_some() {
            self.payload_size - EQUIVOCATION_OWNER_RESERVED
        } else {
            self.payload_size
        }
    }

    /// Absorbs one downstream cell into the equivocation history.
    pub fn update_history(&mut self, downstream: &[u8]) {
        if let Some(eq) = &mut self.equivocation {
            eq.update_history(downstream);
        }
    }

    /// Advances the pad streams to `round`, discarding skipped material.
    fn advance_to(&mut self, round: RoundId) -> Result<()> {
        if round < self.current_round {
            return Err(Error::Fatal(format!(
                "cannot encode for past round {round}, streams are at {}",
                self.current_round
            )));
        }
        while self.current_round < round {
            for stream in &mut self.streams {
                stream.skip(self.payload_size);
            }
            self.current_round += 1;
        }
        Ok(())
    }

    fn draw_pads(&mut self) -> Vec<Vec<u8>> {
        let size = self.payload_size;
        self.streams.iter_mut().map(|s| s.draw(size)).collect()
    }

    /// Client-side encode for `round`. `payload` may be empty.
    pub fn encode(
        &mut self,
        round: RoundId,
        slot_owner: bool,
        payload: &[u8],
    ) -> Result<DcNetCipher> {
        if self.role != CodecRole::Client {
            return Err(Error::Fatal("encode is client-only".into()));
        }
        if payload.len() > self.client_capacity(slot_owner) {
            return Err(Error::Fatal(format!(
                "payload of {} bytes exceeds capacity {}",
                payload.len(),
                self.client_capacity(slot_owner)
            )));
        }
        self.advance_to(round)?;
        let mut buffer = vec![0u8; self.payload_size];
        buffer[..payload.len()].copy_from_slice(payload);
        let pads = self.draw_pads();
        let tag = self
            .equivocation
            .as_mut()
            .map(|eq| eq.client_encode(slot_owner, &mut buffer, &pads));
        for pad in &pads {
            for (b, p) in buffer.iter_mut().zip(pad) {
                *b ^= p;
            }
        }
        self.current_round += 1;
        Ok(DcNetCipher {
            payload: buffer,
            tag,
        })
    }

    /// Trustee-side encode for `round`; trustees carry no payload.
    pub fn encode_trustee(&mut self, round: RoundId) -> Result<DcNetCipher> {
        if self.role != CodecRole::Trustee {
            return Err(Error::Fatal("encode_trustee is trustee-only".into()));
        }
        self.advance_to(round)?;
        let mut buffer = vec![0u8; self.payload_size];
        let pads = self.draw_pads();
        for pad in &pads {
            for (b, p) in buffer.iter_mut().zip(pad) {
                *b ^= p;
            }
        }
        let tag = self
            .equivocation
            .as_ref()
            .map(|eq| eq.trustee_contribution(&pads));
        self.current_round += 1;
        Ok(DcNetCipher {
            payload: buffer,
            tag,
        })
    }

    /// Rebuilds the pad streams from their seeds and returns the pads of
    /// an arbitrary `round` without mutating the canonical state.
    #[must_use]
    pub fn replay_pads(&self, round: RoundId) -> Vec<Vec<u8>> {
        self.seeds
            .iter()
            .map(|seed| {
                let mut stream = PadStream::new(&seed[..]);
                stream.skip(round as usize * self.payload_size);
                stream.draw(self.payload_size)
            })
            .collect()
    }

    /// Relay-side: opens the accumulator for one round.
    pub fn decode_start(&mut self, round: RoundId) {
        self.decoder = Some(RoundDecoder {
            round,
            xor: vec![0u8; self.payload_size],
            client_tags: Vec::new(),
            trustee_tags: Vec::new(),
        });
    }

    fn decode_add(&mut self, round: RoundId, cipher: &DcNetCipher, from_client: bool) -> Result<()> {
        let equivocation = self.equivocation.is_some();
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::Fatal("decode_add before decode_start".into()))?;
        if round != decoder.round {
            return Err(Error::Fatal(format!(
                "cannot add cipher for round {round}, decoding round {}",
                decoder.round
            )));
        }
        if cipher.payload.len() != decoder.xor.len() {
            return Err(Error::Crypto(format!(
                "cipher payload must be {} bytes, got {}",
                decoder.xor.len(),
                cipher.payload.len()
            )));
        }
        for (b, p) in decoder.xor.iter_mut().zip(&cipher.payload) {
            *b ^= p;
        }
        if equivocation {
            let tag = cipher
                .tag
                .ok_or_else(|| Error::Crypto("cipher is missing its equivocation tag".into()))?;
            if from_client {
                decoder.client_tags.push(tag);
            } else {
                decoder.trustee_tags.push(tag);
            }
        }
        Ok(())
    }

    /// Folds one client contribution into the open round.
    pub fn decode_client(&mut self, round: RoundId, cipher: &DcNetCipher) -> Result<()> {
        self.decode_add(round, cipher, true)
    }

    /// Folds one trustee contribution into the open round.
    pub fn decode_trustee(&mut self, round: RoundId, cipher: &DcNetCipher) -> Result<()> {
        self.decode_add(round, cipher, false)
    }

    /// Closes the round and returns `(plaintext, raw_xor)`.
    pub fn decode_finish(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::Fatal("decode_finish before decode_start".into()))?;
        let plaintext = match &self.equivocation {
            Some(eq) => eq.relay_decode(&decoder.xor, &decoder.client_tags, &decoder.trustee_tags),
            None => decoder.xor.clone(),
        };
        Ok((plaintext, decoder.xor))
    }
}

impl std::fmt::Debug for DcNetCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcNetCodec")
            .field("role", &self.role)
            .field("payload_size", &self.payload_size)
            .field("peers", &self.streams.len())
            .field("current_round", &self.current_round)
            .field("equivocation", &self.equivocation.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{pad_seed, shared_secret, KeyPair};
    use rand::rngs::OsRng;

    struct TestNet {
        clients: Vec<DcNetCodec>,
        trustees: Vec<DcNetCodec>,
        relay: DcNetCodec,
        payload_size: usize,
    }

    fn build_net(n: usize, t: usize, payload_size: usize, equivocation: bool) -> TestNet {
        let mut rng = OsRng;
        let client_keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
        let trustee_keys: Vec<KeyPair> = (0..t).map(|_| KeyPair::generate(&mut rng)).collect();
        let clients = client_keys
            .iter()
            .map(|ck| {
                let seeds = trustee_keys
                    .iter()
                    .map(|tk| pad_seed(&shared_secret(ck.secret(), &tk.public())))
                    .collect();
                DcNetCodec::new(CodecRole::Client, payload_size, equivocation, seeds, &mut rng)
                    .unwrap()
            })
            .collect();
        let trustees = trustee_keys
            .iter()
            .map(|tk| {
                let seeds = client_keys
                    .iter()
                    .map(|ck| pad_seed(&shared_secret(tk.secret(), &ck.public())))
                    .collect();
                DcNetCodec::new(CodecRole::Trustee, payload_size, equivocation, seeds, &mut rng)
                    .unwrap()
            })
            .collect();
        let relay =
            DcNetCodec::new(CodecRole::Relay, payload_size, equivocation, Vec::new(), &mut rng)
                .unwrap();
        TestNet {
            clients,
            trustees,
            relay,
            payload_size,
        }
    }

    fn run_round(net: &mut TestNet, round: RoundId, owner: usize, payload: &[u8]) -> Vec<u8> {
        let downstream = round.to_be_bytes();
        net.relay.decode_start(round);
        for (i, client) in net.clients.iter_mut().enumerate() {
            client.update_history(&downstream);
            let cell = client
                .encode(round, i == owner, if i == owner { payload } else { &[] })
                .unwrap();
            net.relay.decode_client(round, &cell).unwrap();
        }
        for trustee in net.trustees.iter_mut() {
            trustee.update_history(&downstream);
            let cell = trustee.encode_trustee(round).unwrap();
            net.relay.decode_trustee(round, &cell).unwrap();
        }
        let (plaintext, _raw) = net.relay.decode_finish().unwrap();
        plaintext
    }

    fn expect_padded(payload: &[u8], size: usize) -> Vec<u8> {
        let mut expected = vec![0u8; size];
        expected[..payload.len()].copy_from_slice(payload);
        expected
    }

    #[test]
    fn xor_of_all_cells_recovers_owner_payload() {
        for equivocation in [false, true] {
            for n in 2..=8 {
                for t in 1..=4 {
                    let mut net = build_net(n, t, 32, equivocation);
                    for round in 0..3u32 {
                        let owner = round as usize % n;
                        let payload = [round as u8 + 1, owner as u8, 0xcd];
                        let plaintext = run_round(&mut net, round, owner, &payload);
                        assert_eq!(
                            plaintext,
                            expect_padded(&payload, net.payload_size),
                            "n={n} t={t} round={round} equivocation={equivocation}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn payload_sizes_across_range() {
        for payload_size in [16, 64, 4096] {
            let mut net = build_net(3, 2, payload_size, false);
            let payload = vec![0x5a; payload_size.min(40)];
            let plaintext = run_round(&mut net, 0, 0, &payload);
            assert_eq!(plaintext, expect_padded(&payload, payload_size));
        }
    }

    #[test]
    fn empty_round_decodes_to_zeros() {
        let mut net = build_net(2, 1, 32, false);
        let plaintext = run_round(&mut net, 0, 0, &[]);
        assert_eq!(plaintext, vec![0u8; 32]);
    }

    #[test]
    fn pad_lockstep_matches_fast_forward() {
        let mut rng = OsRng;
        let client = KeyPair::generate(&mut rng);
        let trustee = KeyPair::generate(&mut rng);
        let seeds = || vec![pad_seed(&shared_secret(trustee.secret(), &client.public()))];
        let mut sequential =
            DcNetCodec::new(CodecRole::Trustee, 32, false, seeds(), &mut rng).unwrap();
        let mut jumped = DcNetCodec::new(CodecRole::Trustee, 32, false, seeds(), &mut rng).unwrap();
        for round in 0..5u32 {
            sequential.encode_trustee(round).unwrap();
        }
        let step = sequential.encode_trustee(5).unwrap();
        let jump = jumped.encode_trustee(5).unwrap();
        assert_eq!(step, jump);
    }

    #[test]
    fn encoding_past_round_is_fatal() {
        let mut net = build_net(2, 1, 32, false);
        net.clients[0].encode(3, false, &[]).unwrap();
        let err = net.clients[0].encode(1, false, &[]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let mut net = build_net(2, 1, 16, false);
        let err = net.clients[0].encode(0, true, &[0u8; 17]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn owner_capacity_shrinks_with_equivocation() {
        let mut net = build_net(2, 1, 64, true);
        assert_eq!(
            net.clients[0].client_capacity(true),
            64 - EQUIVOCATION_OWNER_RESERVED
        );
        assert_eq!(net.clients[0].client_capacity(false), 64);
        let err = net.clients[0]
            .encode(0, true, &vec![0u8; 64 - EQUIVOCATION_OWNER_RESERVED + 1])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn replay_pads_reproduce_consumed_material() {
        let mut net = build_net(2, 3, 32, false);
        let cell0 = net.trustees[0].encode_trustee(0).unwrap();
        let replayed = net.trustees[0].replay_pads(0);
        let mut xor = vec![0u8; 32];
        for pad in &replayed {
            for (b, p) in xor.iter_mut().zip(pad) {
                *b ^= p;
            }
        }
        assert_eq!(xor, cell0.payload);
        // canonical state keeps moving forward only
        assert_eq!(net.trustees[0].current_round(), 1);
    }

    #[test]
    fn cipher_wire_roundtrip() {
        let mut net = build_net(2, 1, 32, true);
        net.clients[0].update_history(b"down");
        let cell = net.clients[0].encode(0, true, b"hello").unwrap();
        let bytes = cell.to_bytes();
        assert_eq!(bytes.len(), DcNetCipher::wire_len(32, true));
        let decoded = DcNetCipher::from_bytes(&bytes, 32, true).unwrap();
        assert_eq!(decoded, cell);
        assert!(DcNetCipher::from_bytes(&bytes[..10], 32, true).is_err());
    }

    #[test]
    fn diverging_history_corrupts_decode() {
        let mut net = build_net(2, 1, 32, true);
        net.relay.decode_start(0);
        net.clients[0].update_history(b"agreed");
        net.clients[1].update_history(b"tampered");
        net.trustees[0].update_history(b"agreed");
        let payload = b"secret";
        let c0 = net.clients[0].encode(0, true, payload).unwrap();
        let c1 = net.clients[1].encode(0, false, &[]).unwrap();
        let t0 = net.trustees[0].encode_trustee(0).unwrap();
        net.relay.decode_client(0, &c0).unwrap();
        net.relay.decode_client(0, &c1).unwrap();
        net.relay.decode_trustee(0, &t0).unwrap();
        let (plaintext, _) = net.relay.decode_finish().unwrap();
        assert_ne!(plaintext, expect_padded(payload, 32));
    }
}
