// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Fixed wire encodings.
//!
//! Key lists travel as `u32 msg_type(=2) || repeat { u32 key_len ||
//! key_len bytes }`, points in the group's canonical binary form.
//! Downstream data-plane frames are `u32 connection_id || u16 payload_len
//! || payload_len bytes`; the same 6-byte header opens every decoded
//! upstream slot, with a zero connection id marking an empty slot.
//! Latency probes are 16-byte records `u16 0xAAAA || u16 client_id ||
//! u64 ms_timestamp || u32 origin_round`, repeated to fill the slot.

use curve25519_dalek::ristretto::RistrettoPoint;

use crate::crypto::{decode_point, POINT_LEN};
use crate::{ClientId, ConnectionId, Error, Result, RoundId};

/// Wire tag of a marshalled public-key list.
pub const MESSAGE_TYPE_PUBLIC_KEYS: u32 = 2;
/// Byte length of the slot header `(connection_id, length)`.
pub const SLOT_HEADER_LEN: usize = 6;
/// Byte length of one latency-probe record.
pub const PROBE_RECORD_LEN: usize = 16;
/// Pattern opening every latency-probe record.
pub const PROBE_PATTERN: u16 = 0xAAAA;
/// Upper bound on the number of keys accepted from one list.
const MAX_KEYS: usize = 4096;

/// Encodes a list of public keys.
#[must_use]
pub fn encode_key_list(keys: &[RistrettoPoint]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + keys.len() * (4 + POINT_LEN));
    out.extend_from_slice(&MESSAGE_TYPE_PUBLIC_KEYS.to_be_bytes());
    for key in keys {
        let bytes = key.compress().to_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }
    out
}

/// Decodes a key list, stopping at a zero length marker or the end of the
/// buffer, as the emitters do.
pub fn decode_key_list(buffer: &[u8]) -> Result<Vec<RistrettoPoint>> {
    if buffer.len() < 4 {
        return Err(Error::Crypto("key list shorter than its type tag".into()));
    }
    let msg_type = u32::from_be_bytes(buffer[..4].try_into().expect("fixed slice"));
    if msg_type != MESSAGE_TYPE_PUBLIC_KEYS {
        return Err(Error::Crypto(format!(
            "key list starts with type {msg_type}, expected {MESSAGE_TYPE_PUBLIC_KEYS}"
        )));
    }
    let mut keys = Vec::new();
    let mut offset = 4;
    while offset + 4 <= buffer.len() {
        let len = u32::from_be_bytes(buffer[offset..offset + 4].try_into().expect("fixed slice"))
            as usize;
        if len == 0 {
            break;
        }
        offset += 4;
        if offset + len > buffer.len() {
            return Err(Error::Crypto("key list truncated mid-key".into()));
        }
        keys.push(decode_point(&buffer[offset..offset + len])?);
        offset += len;
        if keys.len() > MAX_KEYS {
            return Err(Error::Crypto("key list exceeds the key cap".into()));
        }
    }
    Ok(keys)
}

/// Frames data-plane bytes for one connection.
#[must_use]
pub fn encode_slot(connection_id: ConnectionId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SLOT_HEADER_LEN + data.len());
    out.extend_from_slice(&connection_id.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Parses a decoded slot. Returns `None` for an empty slot (zero
/// connection id); errors when the advertised length overruns the slot.
pub fn parse_slot(slot: &[u8]) -> Result<Option<(ConnectionId, &[u8])>> {
    if slot.len() < SLOT_HEADER_LEN {
        return Err(Error::Crypto(format!(
            "slot shorter than its {SLOT_HEADER_LEN}-byte header"
        )));
    }
    let connection_id = u32::from_be_bytes(slot[..4].try_into().expect("fixed slice"));
    if connection_id == 0 {
        return Ok(None);
    }
    let len = u16::from_be_bytes(slot[4..6].try_into().expect("fixed slice")) as usize;
    if SLOT_HEADER_LEN + len > slot.len() {
        return Err(Error::Crypto(format!(
            "slot advertises {len} payload bytes but only {} remain",
            slot.len() - SLOT_HEADER_LEN
        )));
    }
    Ok(Some((
        connection_id,
        &slot[SLOT_HEADER_LEN..SLOT_HEADER_LEN + len],
    )))
}

/// One parsed latency-probe record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeRecord {
    pub client_id: ClientId,
    pub ms_timestamp: u64,
    pub origin_round: RoundId,
}

/// Whether a buffer opens with the probe pattern.
///
/// Connection ids stay far below `0xAAAA_0000`, so the pattern cannot
/// collide with a framed slot header.
#[must_use]
pub fn is_probe(data: &[u8]) -> bool {
    data.len() >= 2 && data[0..2] == PROBE_PATTERN.to_be_bytes()
}

/// Fills `capacity` bytes with as many copies of the probe record as fit.
#[must_use]
pub fn encode_probes(
    client_id: ClientId,
    ms_timestamp: u64,
    origin_round: RoundId,
    capacity: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(capacity);
    while out.len() + PROBE_RECORD_LEN <= capacity {
        out.extend_from_slice(&PROBE_PATTERN.to_be_bytes());
        out.extend_from_slice(&client_id.to_be_bytes());
        out.extend_from_slice(&ms_timestamp.to_be_bytes());
        out.extend_from_slice(&origin_round.to_be_bytes());
    }
    out
}

/// Extracts every well-formed probe record from a probe buffer.
#[must_use]
pub fn parse_probes(data: &[u8]) -> Vec<ProbeRecord> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + PROBE_RECORD_LEN <= data.len() {
        let chunk = &data[offset..offset + PROBE_RECORD_LEN];
        if chunk[0..2] != PROBE_PATTERN.to_be_bytes() {
            break;
        }
        records.push(ProbeRecord {
            client_id: u16::from_be_bytes(chunk[2..4].try_into().expect("fixed slice")),
            ms_timestamp: u64::from_be_bytes(chunk[4..12].try_into().expect("fixed slice")),
            origin_round: u32::from_be_bytes(chunk[12..16].try_into().expect("fixed slice")),
        });
        offset += PROBE_RECORD_LEN;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use rand::rngs::OsRng;

    #[test]
    fn key_list_roundtrip() {
        let mut rng = OsRng;
        let keys: Vec<_> = (0..5).map(|_| KeyPair::generate(&mut rng).public()).collect();
        let encoded = encode_key_list(&keys);
        let decoded = decode_key_list(&encoded).unwrap();
        assert_eq!(decoded.len(), keys.len());
        for (a, b) in keys.iter().zip(&decoded) {
            assert_eq!(a.compress(), b.compress());
        }
    }

    #[test]
    fn key_list_rejects_wrong_type_tag() {
        let mut encoded = encode_key_list(&[]);
        encoded[3] = 7;
        assert!(decode_key_list(&encoded).is_err());
    }

    #[test]
    fn key_list_stops_at_zero_length() {
        let mut rng = OsRng;
        let keys = vec![KeyPair::generate(&mut rng).public()];
        let mut encoded = encode_key_list(&keys);
        encoded.extend_from_slice(&0u32.to_be_bytes());
        encoded.extend_from_slice(b"trailing junk");
        assert_eq!(decode_key_list(&encoded).unwrap().len(), 1);
    }

    #[test]
    fn key_list_rejects_truncated_key() {
        let mut rng = OsRng;
        let encoded = encode_key_list(&[KeyPair::generate(&mut rng).public()]);
        assert!(decode_key_list(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn slot_roundtrip_and_empty_slot() {
        let framed = encode_slot(9, b"payload");
        let (conn, data) = parse_slot(&framed).unwrap().unwrap();
        assert_eq!(conn, 9);
        assert_eq!(data, b"payload");

        let empty = vec![0u8; 32];
        assert_eq!(parse_slot(&empty).unwrap(), None);
    }

    #[test]
    fn slot_rejects_overrunning_length() {
        let mut framed = encode_slot(4, b"abc");
        framed[5] = 200;
        assert!(parse_slot(&framed).is_err());
    }

    #[test]
    fn probes_fill_and_parse() {
        let buf = encode_probes(3, 1_234_567, 7, 40);
        // two whole records fit in 40 bytes
        assert_eq!(buf.len(), 2 * PROBE_RECORD_LEN);
        assert!(is_probe(&buf));
        let records = parse_probes(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            ProbeRecord {
                client_id: 3,
                ms_timestamp: 1_234_567,
                origin_round: 7
            }
        );
    }

    #[test]
    fn framed_slot_is_not_a_probe() {
        let framed = encode_slot(1, b"data");
        assert!(!is_probe(&framed));
    }
}
