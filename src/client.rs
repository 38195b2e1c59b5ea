// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Client participant.
//!
//! The client owns a long-term key pair, derives one pad seed per trustee
//! after learning their keys, generates a fresh ephemeral pair per setup,
//! and recognizes its slot in the signed shuffle result. In the steady
//! state it answers every downstream frame with one upstream cell,
//! embedding data-plane bytes when it owns the round's slot. Out-of-order
//! downstream frames land in a bounded reorder buffer; a resync frame
//! rolls the client back to `INITIALIZING` and discards in-flight data.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use rand::rngs::OsRng;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::config::{ParamsMap, SessionParams, PARAM_NEXT_FREE_CLIENT_ID};
use crate::crypto::{pad_seed, shared_secret, KeyPair};
use crate::dcnet::{CodecRole, DcNetCodec};
use crate::net::{dispatch, wire, DownstreamFrame, Message, MessageRouter, Outgoing};
use crate::shuffle::{find_slot, verify_signatures};
use crate::state::{ClientState, StateMachine};
use crate::stats::{unix_ms, Statistics};
use crate::{ClientId, Error, Result, RoundId};

/// Protocol core of one client.
pub struct Client {
    id: ClientId,
    long_term: KeyPair,
    sm: StateMachine<ClientState>,
    params: Option<SessionParams>,
    trustee_pks: Vec<RistrettoPoint>,
    ephemeral: Option<KeyPair>,
    codec: Option<DcNetCodec>,
    my_slot: Option<usize>,
    round_no: RoundId,
    buffered: BTreeMap<RoundId, DownstreamFrame>,
    /// Data-plane bytes waiting for an owned slot, already slot-framed.
    upstream_queue: VecDeque<Vec<u8>>,
    data_out: mpsc::UnboundedSender<Vec<u8>>,
    data_output_enabled: bool,
    stats: Statistics,
}

impl Client {
    #[must_use]
    pub fn new(id: ClientId, data_out: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        let mut rng = OsRng;
        Self {
            id,
            long_term: KeyPair::generate(&mut rng),
            sm: StateMachine::new("client", ClientState::BeforeInit),
            params: None,
            trustee_pks: Vec::new(),
            ephemeral: None,
            codec: None,
            my_slot: None,
            round_no: 0,
            buffered: BTreeMap::new(),
            upstream_queue: VecDeque::new(),
            data_out,
            data_output_enabled: true,
            stats: Statistics::new(std::time::Instant::now()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.sm.current()
    }

    #[must_use]
    pub fn my_slot(&self) -> Option<usize> {
        self.my_slot
    }

    #[must_use]
    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Queues data-plane bytes (already `(connection_id, length)`-framed)
    /// for the next owned slot.
    pub fn offer_data(&mut self, framed: Vec<u8>) {
        self.upstream_queue.push_back(framed);
    }

    fn params(&self) -> Result<&SessionParams> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::Fatal("session parameters not seated".into()))
    }

    fn clear_session(&mut self) {
        // ephemeral keys, pad seeds, and streams are zeroized on drop
        self.ephemeral = None;
        self.codec = None;
        self.my_slot = None;
        self.round_no = 0;
        self.buffered.clear();
        self.upstream_queue.clear();
    }

    /// Dispatches one inbound message.
    pub fn handle(&mut self, msg: Message) -> Result<Vec<Outgoing>> {
        let kind = msg.kind();
        match msg {
            Message::Parameters(map) => {
                if !map.force {
                    self.sm.expect(kind)?;
                }
                self.seat_parameters(&map)
            }
            Message::Shutdown => {
                self.sm.transition(ClientState::Shutdown);
                self.clear_session();
                Ok(Vec::new())
            }
            Message::TrusteesPublicKeys { pks } => {
                self.sm.expect(kind)?;
                self.on_trustee_keys(pks)
            }
            Message::ShuffleResult {
                base,
                eph_pks,
                signatures,
            } => {
                self.sm.expect(kind)?;
                self.on_shuffle_result(&base, &eph_pks, &signatures)
            }
            Message::Downstream(frame) | Message::DownstreamUdp(frame) => {
                self.sm.expect(kind)?;
                self.on_downstream(frame)
            }
            other => {
                self.sm.expect(other.kind())?;
                Ok(Vec::new())
            }
        }
    }

    fn seat_parameters(&mut self, map: &ParamsMap) -> Result<Vec<Outgoing>> {
        let params = SessionParams::from_map(map)?;
        let id = map.int_or(PARAM_NEXT_FREE_CLIENT_ID, -1);
        if id >= 0 {
            self.id = id as ClientId;
        }
        self.params = Some(params);
        self.clear_session();
        self.sm.transition(ClientState::Initializing);
        info!(client = self.id, "parameters seated");
        Ok(Vec::new())
    }

    fn on_trustee_keys(&mut self, pks: Vec<RistrettoPoint>) -> Result<Vec<Outgoing>> {
        let params = self.params()?.clone();
        if pks.len() != params.n_trustees {
            return Err(Error::Protocol(format!(
                "got {} trustee keys, session has {} trustees",
                pks.len(),
                params.n_trustees
            )));
        }
        let mut rng = OsRng;
        let seeds = pks
            .iter()
            .map(|pk| pad_seed(&shared_secret(self.long_term.secret(), pk)))
            .collect();
        self.codec = Some(DcNetCodec::new(
            CodecRole::Client,
            params.payload_size,
            params.equivocation,
            seeds,
            &mut rng,
        )?);
        self.trustee_pks = pks;
        let ephemeral = KeyPair::generate(&mut rng);
        let eph_pk = ephemeral.public();
        self.ephemeral = Some(ephemeral);
        self.sm.transition(ClientState::EphKeysSent);
        Ok(vec![Outgoing::ToRelay(Message::ClientKeys {
            client_id: self.id,
            pk: self.long_term.public(),
            eph_pk,
        })])
    }

    fn on_shuffle_result(
        &mut self,
        base: &RistrettoPoint,
        eph_pks: &[RistrettoPoint],
        signatures: &[crate::crypto::schnorr::Signature],
    ) -> Result<Vec<Outgoing>> {
        let params = self.params()?.clone();
        verify_signatures(&self.trustee_pks, base, eph_pks, signatures)?;
        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| Error::Fatal("shuffle result before ephemeral keys".into()))?;
        let slot = match find_slot(ephemeral.secret(), base, eph_pks) {
            Some(slot) => slot,
            None if params.allow_degraded_slot => {
                // recoverable only under operator override
                error!(
                    client = self.id,
                    "slot not found in shuffle, falling back to own id"
                );
                usize::from(self.id)
            }
            None => {
                return Err(Error::Crypto(format!(
                    "client {} cannot recognize its slot in the shuffle",
                    self.id
                )));
            }
        };
        self.my_slot = Some(slot);
        self.round_no = 0;
        self.buffered.clear();
        self.sm.transition(ClientState::Ready);
        info!(client = self.id, slot, "shuffle verified, ready to communicate");
        Ok(Vec::new())
    }

    fn on_downstream(&mut self, frame: DownstreamFrame) -> Result<Vec<Outgoing>> {
        // a resync rolls the session back no matter where the round
        // counter stands
        if frame.flag_resync {
            return self.process_frame(frame);
        }
        if frame.round_id < self.round_no {
            warn!(
                client = self.id,
                round = frame.round_id,
                current = self.round_no,
                "dropping downstream frame for a past round"
            );
            return Ok(Vec::new());
        }
        if frame.round_id > self.round_no {
            let cap = self.params()?.window as usize;
            self.buffered.insert(frame.round_id, frame);
            while self.buffered.len() > cap {
                let oldest = self.buffered.keys().next().copied();
                if let Some(oldest) = oldest {
                    self.buffered.remove(&oldest);
                    warn!(client = self.id, round = oldest, "reorder buffer full, dropping oldest frame");
                }
            }
            return Ok(Vec::new());
        }
        let mut out = self.process_frame(frame)?;
        while let Some(next) = self.buffered.remove(&self.round_no) {
            if self.sm.current() != ClientState::Ready {
                break;
            }
            out.extend(self.process_frame(next)?);
        }
        Ok(out)
    }

    fn process_frame(&mut self, frame: DownstreamFrame) -> Result<Vec<Outgoing>> {
        self.stats.downstream_cell(frame.data.len());
        if !frame.data.is_empty() {
            if wire::is_probe(&frame.data) {
                self.record_probe_echo(&frame.data);
            } else if self.data_output_enabled {
                let _ = self.data_out.send(frame.data.clone());
            }
        }
        if frame.flag_resync {
            info!(client = self.id, "relay requested resync, back to INITIALIZING");
            self.clear_session();
            self.sm.transition(ClientState::Initializing);
            return Ok(Vec::new());
        }
        let params = self.params()?.clone();
        let slot = self
            .my_slot
            .ok_or_else(|| Error::Fatal("downstream frame before slot assignment".into()))?;
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| Error::Fatal("downstream frame before codec setup".into()))?;
        codec.update_history(&frame.data);

        let round = frame.round_id;
        let is_my_slot = round as usize % params.n_clients == slot;
        let payload = if is_my_slot {
            let capacity = codec.client_capacity(true);
            match self.upstream_queue.pop_front() {
                Some(data) if data.len() <= capacity => data,
                Some(data) => {
                    warn!(
                        client = self.id,
                        len = data.len(),
                        capacity,
                        "dropping oversized data-plane frame"
                    );
                    Vec::new()
                }
                None if params.latency_probes && capacity >= wire::PROBE_RECORD_LEN => {
                    wire::encode_probes(self.id, unix_ms(), round, capacity)
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        let cipher = codec.encode(round, is_my_slot, &payload)?;
        self.stats.upstream_cell(cipher.payload.len());
        self.round_no = round + 1;
        Ok(vec![Outgoing::ToRelay(Message::UpstreamData {
            client_id: self.id,
            round_id: round,
            cipher,
        })])
    }

    fn record_probe_echo(&mut self, data: &[u8]) {
        for record in wire::parse_probes(data) {
            if record.client_id == self.id {
                let latency = unix_ms().saturating_sub(record.ms_timestamp);
                self.stats.add_latency(latency);
                info!(
                    client = self.id,
                    latency_ms = latency,
                    origin_round = record.origin_round,
                    "measured latency"
                );
            }
        }
    }
}

/// Actor wrapper driving a [`Client`] core from its inbox, its data-plane
/// queue, and (optionally) the UDP downstream broadcast.
pub struct ClientActor {
    core: Client,
    inbox: mpsc::UnboundedReceiver<Message>,
    data_in: mpsc::UnboundedReceiver<Vec<u8>>,
    router: Arc<dyn MessageRouter>,
}

impl ClientActor {
    #[must_use]
    pub fn new(
        core: Client,
        inbox: mpsc::UnboundedReceiver<Message>,
        data_in: mpsc::UnboundedReceiver<Vec<u8>>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        Self {
            core,
            inbox,
            data_in,
            router,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        enum Wake {
            Inbox(Option<Message>),
            Data(Option<Vec<u8>>),
            Udp(std::result::Result<Message, broadcast::error::RecvError>),
        }

        async fn recv_udp(
            udp: &mut Option<broadcast::Receiver<Message>>,
        ) -> std::result::Result<Message, broadcast::error::RecvError> {
            match udp.as_mut() {
                Some(rx) => rx.recv().await,
                None => Err(broadcast::error::RecvError::Closed),
            }
        }

        let mut udp: Option<broadcast::Receiver<Message>> = self.router.subscribe_broadcast();
        let mut udp_open = udp.is_some();
        let mut data_open = true;
        loop {
            let wake = tokio::select! {
                msg = self.inbox.recv() => Wake::Inbox(msg),
                udp_msg = recv_udp(&mut udp), if udp_open => Wake::Udp(udp_msg),
                data = self.data_in.recv(), if data_open => Wake::Data(data),
            };
            let msg = match wake {
                Wake::Inbox(None) => break,
                Wake::Inbox(Some(msg)) => msg,
                Wake::Udp(Ok(msg)) => msg,
                // a lagging datagram subscriber just misses frames
                Wake::Udp(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Wake::Udp(Err(broadcast::error::RecvError::Closed)) => {
                    udp_open = false;
                    continue;
                }
                Wake::Data(Some(framed)) => {
                    self.core.offer_data(framed);
                    continue;
                }
                // the data plane may close while the protocol keeps running
                Wake::Data(None) => {
                    data_open = false;
                    continue;
                }
            };
            match self.core.handle(msg) {
                Ok(out) => dispatch(self.router.as_ref(), out).await?,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(client = self.core.id(), %err, "message dropped"),
            }
            if self.core.state() == ClientState::Shutdown {
                break;
            }
        }
        Ok(())
    }
}
