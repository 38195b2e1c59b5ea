// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! The closed message union exchanged between relay, clients, and
//! trustees. The state machines dispatch on [`MessageKind`]; there is no
//! subtyping.

use curve25519_dalek::ristretto::RistrettoPoint;

use crate::config::ParamsMap;
use crate::crypto::schnorr::Signature;
use crate::dcnet::DcNetCipher;
use crate::shuffle::ShuffleStep;
use crate::{ClientId, RoundId, TrusteeId};

/// One downstream cell `(round_id, flags, data)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownstreamFrame {
    pub round_id: RoundId,
    /// Rolls every client back to `INITIALIZING` when set.
    pub flag_resync: bool,
    pub data: Vec<u8>,
}

/// Every message of the protocol, tagged by origin and direction.
#[derive(Clone, Debug)]
pub enum Message {
    /// ALL_ALL_PARAMETERS: (re-)seats the session parameters.
    Parameters(ParamsMap),
    /// ALL_ALL_SHUTDOWN: unconditional transition to SHUTDOWN.
    Shutdown,
    /// TRU_REL_TELL_PK: a trustee announces its long-term key.
    TrusteePublicKey {
        trustee_id: TrusteeId,
        pk: RistrettoPoint,
    },
    /// REL_CLI_TELL_TRUSTEES_PK: the trustees' long-term keys, in trustee
    /// order.
    TrusteesPublicKeys { pks: Vec<RistrettoPoint> },
    /// CLI_REL_TELL_PK_AND_EPH_PK: a client's long-term and ephemeral keys.
    ClientKeys {
        client_id: ClientId,
        pk: RistrettoPoint,
        eph_pk: RistrettoPoint,
    },
    /// REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE: shuffle input for
    /// one trustee, together with the client long-term keys it derives
    /// its pad seeds from.
    ShuffleRequest {
        base: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
        client_pks: Vec<RistrettoPoint>,
    },
    /// TRU_REL_TELL_NEW_BASE_AND_EPH_PKS: one trustee's shuffle step.
    TrusteeShuffled {
        trustee_id: TrusteeId,
        step: ShuffleStep,
    },
    /// REL_TRU_TELL_TRANSCRIPT: the final `(G_T, E_T)` for signing.
    ShuffleTranscript {
        base: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
    },
    /// TRU_REL_SHUFFLE_SIG: a trustee's transcript signature.
    TrusteeShuffleSig {
        trustee_id: TrusteeId,
        signature: Signature,
    },
    /// REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG: the signed shuffle result.
    ShuffleResult {
        base: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
        signatures: Vec<Signature>,
    },
    /// CLI_REL_UPSTREAM_DATA: one client cell for one round.
    UpstreamData {
        client_id: ClientId,
        round_id: RoundId,
        cipher: DcNetCipher,
    },
    /// TRU_REL_DC_CIPHER: one trustee cell for one round.
    TrusteeCipher {
        trustee_id: TrusteeId,
        round_id: RoundId,
        cipher: DcNetCipher,
    },
    /// REL_CLI_DOWNSTREAM_DATA.
    Downstream(DownstreamFrame),
    /// REL_CLI_DOWNSTREAM_DATA_UDP: same frame, broadcast datagram path.
    DownstreamUdp(DownstreamFrame),
}

/// Discriminant of [`Message`], used by the state machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Parameters,
    Shutdown,
    TrusteePublicKey,
    TrusteesPublicKeys,
    ClientKeys,
    ShuffleRequest,
    TrusteeShuffled,
    ShuffleTranscript,
    TrusteeShuffleSig,
    ShuffleResult,
    UpstreamData,
    TrusteeCipher,
    Downstream,
    DownstreamUdp,
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Parameters(_) => MessageKind::Parameters,
            Message::Shutdown => MessageKind::Shutdown,
            Message::TrusteePublicKey { .. } => MessageKind::TrusteePublicKey,
            Message::TrusteesPublicKeys { .. } => MessageKind::TrusteesPublicKeys,
            Message::ClientKeys { .. } => MessageKind::ClientKeys,
            Message::ShuffleRequest { .. } => MessageKind::ShuffleRequest,
            Message::TrusteeShuffled { .. } => MessageKind::TrusteeShuffled,
            Message::ShuffleTranscript { .. } => MessageKind::ShuffleTranscript,
            Message::TrusteeShuffleSig { .. } => MessageKind::TrusteeShuffleSig,
            Message::ShuffleResult { .. } => MessageKind::ShuffleResult,
            Message::UpstreamData { .. } => MessageKind::UpstreamData,
            Message::TrusteeCipher { .. } => MessageKind::TrusteeCipher,
            Message::Downstream(_) => MessageKind::Downstream,
            Message::DownstreamUdp(_) => MessageKind::DownstreamUdp,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Parameters => "ALL_ALL_PARAMETERS",
            MessageKind::Shutdown => "ALL_ALL_SHUTDOWN",
            MessageKind::TrusteePublicKey => "TRU_REL_TELL_PK",
            MessageKind::TrusteesPublicKeys => "REL_CLI_TELL_TRUSTEES_PK",
            MessageKind::ClientKeys => "CLI_REL_TELL_PK_AND_EPH_PK",
            MessageKind::ShuffleRequest => "REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE",
            MessageKind::TrusteeShuffled => "TRU_REL_TELL_NEW_BASE_AND_EPH_PKS",
            MessageKind::ShuffleTranscript => "REL_TRU_TELL_TRANSCRIPT",
            MessageKind::TrusteeShuffleSig => "TRU_REL_SHUFFLE_SIG",
            MessageKind::ShuffleResult => "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
            MessageKind::UpstreamData => "CLI_REL_UPSTREAM_DATA",
            MessageKind::TrusteeCipher => "TRU_REL_DC_CIPHER",
            MessageKind::Downstream => "REL_CLI_DOWNSTREAM_DATA",
            MessageKind::DownstreamUdp => "REL_CLI_DOWNSTREAM_DATA_UDP",
        };
        f.write_str(name)
    }
}
