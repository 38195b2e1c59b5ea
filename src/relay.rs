// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Relay participant: setup orchestration and the synchronous round
//! pipeline.
//!
//! Setup runs trustee-key collection, client-key collection, the shuffle
//! cascade, and transcript signing, in that order. In the steady state
//! the relay keeps at most W downstream rounds in flight: every tick it
//! broadcasts the next downstream frame while the window has room, and
//! concurrently collects one cell from every client and trustee for the
//! oldest open round. Contributions for future rounds wait in per-peer
//! buffers capped at W entries; decoded slots are dispatched to the
//! upstream consumer in strictly increasing round order.
//!
//! A peer that misses the round deadline is reported on the event channel
//! and the relay initiates a resync, rolling every client back to
//! `INITIALIZING`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use curve25519_dalek::ristretto::RistrettoPoint;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{
    SessionParams, PARAM_NEXT_FREE_CLIENT_ID, PARAM_NEXT_FREE_TRUSTEE_ID,
};
use crate::crypto::schnorr::Signature;
use crate::dcnet::{CodecRole, DcNetCipher, DcNetCodec};
use crate::net::{dispatch, wire, DownstreamFrame, Message, MessageRouter, Outgoing};
use crate::shuffle::{CascadeProgress, ShuffleCascade, ShuffleStep};
use crate::state::{RelayState, StateMachine};
use crate::stats::Statistics;
use crate::{ClientId, ConnectionId, Error, Result, Role, RoundId, TrusteeId};

/// Signals surfaced to the operator of a relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Setup finished; the pipeline is running.
    SessionReady,
    /// A peer failed to deliver its contribution before the deadline.
    PeerTimeout {
        role: Role,
        id: u16,
        round: RoundId,
    },
    /// The relay rolled the session back to setup.
    Resync { round: RoundId },
}

#[derive(Clone)]
struct ClientKeyset {
    pk: RistrettoPoint,
    eph_pk: RistrettoPoint,
}

/// Sliding-window bookkeeping for the steady-state rounds.
struct RoundPipeline {
    window: u32,
    next_downstream: RoundId,
    next_to_decode: RoundId,
    client_cells: Vec<BTreeMap<RoundId, DcNetCipher>>,
    trustee_cells: Vec<BTreeMap<RoundId, DcNetCipher>>,
}

impl RoundPipeline {
    fn new(n_clients: usize, n_trustees: usize, window: u32) -> Self {
        Self {
            window,
            next_downstream: 0,
            next_to_decode: 0,
            client_cells: vec![BTreeMap::new(); n_clients],
            trustee_cells: vec![BTreeMap::new(); n_trustees],
        }
    }

    fn reset(&mut self) {
        self.next_downstream = 0;
        self.next_to_decode = 0;
        for map in &mut self.client_cells {
            map.clear();
        }
        for map in &mut self.trustee_cells {
            map.clear();
        }
    }

    fn in_flight(&self) -> u32 {
        self.next_downstream - self.next_to_decode
    }

    fn insert(map: &mut BTreeMap<RoundId, DcNetCipher>, round: RoundId, cipher: DcNetCipher, cap: usize) {
        map.insert(round, cipher);
        while map.len() > cap {
            let oldest = map.keys().next().copied();
            if let Some(oldest) = oldest {
                map.remove(&oldest);
                warn!(round = oldest, "contribution buffer full, dropping oldest cell");
            }
        }
    }

    fn insert_client(&mut self, id: usize, round: RoundId, cipher: DcNetCipher) {
        if round < self.next_to_decode {
            warn!(client = id, round, "dropping cell for an already decoded round");
            return;
        }
        let cap = self.window as usize;
        Self::insert(&mut self.client_cells[id], round, cipher, cap);
    }

    fn insert_trustee(&mut self, id: usize, round: RoundId, cipher: DcNetCipher) {
        if round < self.next_to_decode {
            warn!(trustee = id, round, "dropping cell for an already decoded round");
            return;
        }
        let cap = self.window as usize;
        Self::insert(&mut self.trustee_cells[id], round, cipher, cap);
    }

    /// Whether all N+T contributions of `next_to_decode` are present.
    fn round_ready(&self) -> bool {
        let round = self.next_to_decode;
        self.next_downstream > round
            && self
                .client_cells
                .iter()
                .chain(self.trustee_cells.iter())
                .all(|map| map.contains_key(&round))
    }

    /// Removes and returns the contributions of `next_to_decode`.
    fn take_round(&mut self) -> (Vec<DcNetCipher>, Vec<DcNetCipher>) {
        let round = self.next_to_decode;
        let clients = self
            .client_cells
            .iter_mut()
            .filter_map(|map| map.remove(&round))
            .collect();
        let trustees = self
            .trustee_cells
            .iter_mut()
            .filter_map(|map| map.remove(&round))
            .collect();
        (clients, trustees)
    }

    /// Peers that have not contributed to `next_to_decode` yet.
    fn missing(&self) -> (Vec<ClientId>, Vec<TrusteeId>) {
        let round = self.next_to_decode;
        let clients = self
            .client_cells
            .iter()
            .enumerate()
            .filter(|(_, map)| !map.contains_key(&round))
            .map(|(id, _)| id as ClientId)
            .collect();
        let trustees = self
            .trustee_cells
            .iter()
            .enumerate()
            .filter(|(_, map)| !map.contains_key(&round))
            .map(|(id, _)| id as TrusteeId)
            .collect();
        (clients, trustees)
    }
}

/// Protocol core of the relay.
pub struct Relay {
    params: SessionParams,
    sm: StateMachine<RelayState>,
    trustee_pks: Vec<Option<RistrettoPoint>>,
    client_keys: Vec<Option<ClientKeyset>>,
    cascade: Option<ShuffleCascade>,
    codec: DcNetCodec,
    pipeline: RoundPipeline,
    downstream_queue: VecDeque<Vec<u8>>,
    data_out: mpsc::UnboundedSender<(ConnectionId, Vec<u8>)>,
    events: mpsc::UnboundedSender<RelayEvent>,
    stats: Statistics,
    last_progress: Option<(RoundId, Instant)>,
}

impl Relay {
    pub fn new(
        params: SessionParams,
        data_out: mpsc::UnboundedSender<(ConnectionId, Vec<u8>)>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self> {
        let mut rng = OsRng;
        let codec = DcNetCodec::new(
            CodecRole::Relay,
            params.payload_size,
            params.equivocation,
            Vec::new(),
            &mut rng,
        )?;
        let pipeline = RoundPipeline::new(params.n_clients, params.n_trustees, params.window);
        Ok(Self {
            sm: StateMachine::new("relay", RelayState::BeforeInit),
            trustee_pks: vec![None; params.n_trustees],
            client_keys: vec![None; params.n_clients],
            cascade: None,
            codec,
            pipeline,
            downstream_queue: VecDeque::new(),
            data_out,
            events,
            stats: Statistics::new(Instant::now()),
            last_progress: None,
            params,
        })
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.sm.current()
    }

    #[must_use]
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Window occupancy `next_downstream − next_to_decode`.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.pipeline.in_flight()
    }

    /// Number of rounds decoded and dispatched so far.
    #[must_use]
    pub fn decoded_rounds(&self) -> RoundId {
        self.pipeline.next_to_decode
    }

    /// Queues data-plane bytes for one connection on the next downstream
    /// frame.
    pub fn queue_downstream(&mut self, connection_id: ConnectionId, data: &[u8]) {
        self.downstream_queue
            .push_back(wire::encode_slot(connection_id, data));
    }

    /// Kicks off setup by seating every participant's parameters.
    pub fn start(&mut self) -> Result<Vec<Outgoing>> {
        if self.sm.current() != RelayState::BeforeInit {
            return Err(Error::Fatal("relay started twice".into()));
        }
        let mut out = Vec::new();
        for trustee in 0..self.params.n_trustees {
            let mut map = self.params.to_map();
            map.set_int(PARAM_NEXT_FREE_TRUSTEE_ID, trustee as i64);
            out.push(Outgoing::ToTrustee(
                trustee as TrusteeId,
                Message::Parameters(map),
            ));
        }
        for client in 0..self.params.n_clients {
            let mut map = self.params.to_map();
            map.set_int(PARAM_NEXT_FREE_CLIENT_ID, client as i64);
            out.push(Outgoing::ToClient(
                client as ClientId,
                Message::Parameters(map),
            ));
        }
        self.sm.transition(RelayState::CollectingPubkeys);
        info!(
            clients = self.params.n_clients,
            trustees = self.params.n_trustees,
            "session setup started"
        );
        Ok(out)
    }

    /// The broadcast that tears a session down.
    #[must_use]
    pub fn shutdown_messages(&self) -> Vec<Outgoing> {
        let mut out = vec![Outgoing::Clients(Message::Shutdown)];
        for trustee in 0..self.params.n_trustees {
            out.push(Outgoing::ToTrustee(trustee as TrusteeId, Message::Shutdown));
        }
        out
    }

    /// Dispatches one inbound message.
    pub fn handle(&mut self, msg: Message) -> Result<Vec<Outgoing>> {
        let kind = msg.kind();
        match msg {
            Message::Shutdown => {
                if self.sm.current() == RelayState::Shutdown {
                    return Ok(Vec::new());
                }
                self.sm.transition(RelayState::Shutdown);
                self.clear_session();
                Ok(self.shutdown_messages())
            }
            Message::TrusteePublicKey { trustee_id, pk } => {
                self.sm.expect(kind)?;
                self.on_trustee_pk(trustee_id, pk)
            }
            Message::ClientKeys {
                client_id,
                pk,
                eph_pk,
            } => {
                self.sm.expect(kind)?;
                self.on_client_keys(client_id, pk, eph_pk)
            }
            Message::TrusteeShuffled { trustee_id, step } => {
                self.sm.expect(kind)?;
                self.on_trustee_shuffled(trustee_id, step)
            }
            Message::TrusteeShuffleSig {
                trustee_id,
                signature,
            } => {
                self.sm.expect(kind)?;
                self.on_shuffle_signature(trustee_id, signature)
            }
            Message::UpstreamData {
                client_id,
                round_id,
                cipher,
            } => {
                self.sm.expect(kind)?;
                if usize::from(client_id) >= self.params.n_clients {
                    return Err(Error::Protocol(format!("unknown client {client_id}")));
                }
                self.pipeline
                    .insert_client(usize::from(client_id), round_id, cipher);
                self.try_decode()
            }
            Message::TrusteeCipher {
                trustee_id,
                round_id,
                cipher,
            } => {
                self.sm.expect(kind)?;
                if usize::from(trustee_id) >= self.params.n_trustees {
                    return Err(Error::Protocol(format!("unknown trustee {trustee_id}")));
                }
                self.pipeline
                    .insert_trustee(usize::from(trustee_id), round_id, cipher);
                self.try_decode()
            }
            other => {
                self.sm.expect(other.kind())?;
                Ok(Vec::new())
            }
        }
    }

    fn clear_session(&mut self) {
        self.client_keys = vec![None; self.params.n_clients];
        self.cascade = None;
        self.pipeline.reset();
        self.downstream_queue.clear();
        self.last_progress = None;
    }

    fn on_trustee_pk(&mut self, trustee_id: TrusteeId, pk: RistrettoPoint) -> Result<Vec<Outgoing>> {
        let slot = self
            .trustee_pks
            .get_mut(usize::from(trustee_id))
            .ok_or_else(|| Error::Protocol(format!("unknown trustee {trustee_id}")))?;
        *slot = Some(pk);
        if self.trustee_pks.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }
        self.sm.transition(RelayState::CollectingEphKeys);
        Ok(vec![Outgoing::Clients(Message::TrusteesPublicKeys {
            pks: self.trustee_pk_list(),
        })])
    }

    fn trustee_pk_list(&self) -> Vec<RistrettoPoint> {
        self.trustee_pks.iter().flatten().copied().collect()
    }

    fn on_client_keys(
        &mut self,
        client_id: ClientId,
        pk: RistrettoPoint,
        eph_pk: RistrettoPoint,
    ) -> Result<Vec<Outgoing>> {
        let slot = self
            .client_keys
            .get_mut(usize::from(client_id))
            .ok_or_else(|| Error::Protocol(format!("unknown client {client_id}")))?;
        *slot = Some(ClientKeyset { pk, eph_pk });
        if self.client_keys.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }
        let eph_pks: Vec<RistrettoPoint> = self
            .client_keys
            .iter()
            .flatten()
            .map(|keys| keys.eph_pk)
            .collect();
        let cascade = ShuffleCascade::new(eph_pks, self.params.n_trustees);
        let (base, pks) = cascade.current_input();
        self.cascade = Some(cascade);
        self.sm.transition(RelayState::Shuffling);
        info!("all client keys collected, starting shuffle cascade");
        Ok(vec![Outgoing::ToTrustee(
            0,
            Message::ShuffleRequest {
                base,
                eph_pks: pks,
                client_pks: self.client_pk_list(),
            },
        )])
    }

    fn client_pk_list(&self) -> Vec<RistrettoPoint> {
        self.client_keys
            .iter()
            .flatten()
            .map(|keys| keys.pk)
            .collect()
    }

    fn cascade_mut(&mut self) -> Result<&mut ShuffleCascade> {
        self.cascade
            .as_mut()
            .ok_or_else(|| Error::Fatal("shuffle message without an active cascade".into()))
    }

    fn on_trustee_shuffled(
        &mut self,
        trustee_id: TrusteeId,
        step: ShuffleStep,
    ) -> Result<Vec<Outgoing>> {
        let progress = match self.cascade_mut()?.record_step(trustee_id, step) {
            Ok(progress) => progress,
            Err(err) => return self.abort_setup(err),
        };
        match progress {
            CascadeProgress::Forward(next) => {
                let cascade = self.cascade_mut()?;
                let (base, eph_pks) = cascade.current_input();
                Ok(vec![Outgoing::ToTrustee(
                    next,
                    Message::ShuffleRequest {
                        base,
                        eph_pks,
                        client_pks: self.client_pk_list(),
                    },
                )])
            }
            CascadeProgress::AwaitSignatures => {
                let (base, eph_pks) = self.cascade_mut()?.current_input();
                let mut out = Vec::with_capacity(self.params.n_trustees);
                for trustee in 0..self.params.n_trustees {
                    out.push(Outgoing::ToTrustee(
                        trustee as TrusteeId,
                        Message::ShuffleTranscript {
                            base,
                            eph_pks: eph_pks.clone(),
                        },
                    ));
                }
                Ok(out)
            }
        }
    }

    fn on_shuffle_signature(
        &mut self,
        trustee_id: TrusteeId,
        signature: Signature,
    ) -> Result<Vec<Outgoing>> {
        let trustee_pk = self
            .trustee_pks
            .get(usize::from(trustee_id))
            .copied()
            .flatten()
            .ok_or_else(|| Error::Protocol(format!("unknown trustee {trustee_id}")))?;
        let complete = match self
            .cascade_mut()?
            .record_signature(trustee_id, &trustee_pk, signature)
        {
            Ok(complete) => complete,
            Err(err) => return self.abort_setup(err),
        };
        if !complete {
            return Ok(Vec::new());
        }
        let (base, eph_pks, signatures) = self.cascade_mut()?.result()?;
        self.sm.transition(RelayState::Ready);
        let _ = self.events.send(RelayEvent::SessionReady);
        info!("shuffle signed by all trustees, entering READY");
        let mut out = vec![Outgoing::Clients(Message::ShuffleResult {
            base,
            eph_pks,
            signatures,
        })];
        out.extend(self.tick());
        Ok(out)
    }

    /// A signature or proof failure during setup aborts the session; the
    /// actor broadcasts the shutdown when it sees the state change.
    fn abort_setup(&mut self, err: Error) -> Result<Vec<Outgoing>> {
        error!(%err, "aborting session during setup");
        self.sm.transition(RelayState::Shutdown);
        self.clear_session();
        Err(err)
    }

    /// Builds downstream frames while the window has room.
    fn tick(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while self.sm.current() == RelayState::Ready
            && self.pipeline.in_flight() < self.params.window
        {
            let data = self.downstream_queue.pop_front().unwrap_or_default();
            let frame = DownstreamFrame {
                round_id: self.pipeline.next_downstream,
                flag_resync: false,
                data,
            };
            self.stats.downstream_cell(frame.data.len());
            for trustee in 0..self.params.n_trustees {
                out.push(Outgoing::ToTrustee(
                    trustee as TrusteeId,
                    Message::Downstream(frame.clone()),
                ));
            }
            if self.params.use_udp {
                out.push(Outgoing::ClientsUdp(Message::DownstreamUdp(frame.clone())));
            }
            out.push(Outgoing::Clients(Message::Downstream(frame)));
            self.pipeline.next_downstream += 1;
        }
        out
    }

    /// Decodes every round whose N+T contributions are all present, in
    /// strictly increasing round order.
    fn try_decode(&mut self) -> Result<Vec<Outgoing>> {
        let mut out = Vec::new();
        while self.pipeline.round_ready() {
            let round = self.pipeline.next_to_decode;
            let (client_cells, trustee_cells) = self.pipeline.take_round();
            self.codec.decode_start(round);
            for cell in &client_cells {
                self.codec.decode_client(round, cell)?;
            }
            for cell in &trustee_cells {
                self.codec.decode_trustee(round, cell)?;
            }
            let (plaintext, _raw_xor) = self.codec.decode_finish()?;
            self.stats.upstream_cell(plaintext.len());
            self.pipeline.next_to_decode = round + 1;
            self.last_progress = None;
            self.dispatch_slot(round, plaintext);
            out.extend(self.tick());
        }
        Ok(out)
    }

    fn dispatch_slot(&mut self, round: RoundId, plaintext: Vec<u8>) {
        // latency probes are echoed downstream verbatim
        if wire::is_probe(&plaintext) {
            self.downstream_queue.push_back(plaintext);
            return;
        }
        match wire::parse_slot(&plaintext) {
            Ok(None) => {}
            Ok(Some((connection_id, data))) => {
                let _ = self.data_out.send((connection_id, data.to_vec()));
            }
            Err(err) => warn!(round, %err, "discarding malformed upstream slot"),
        }
    }

    /// Periodic deadline check; initiates a resync when the oldest open
    /// round has been stuck past the configured timeout.
    pub fn check_deadline(&mut self, now: Instant) -> Result<Vec<Outgoing>> {
        self.stats.maybe_report(now);
        if self.sm.current() != RelayState::Ready || self.pipeline.in_flight() == 0 {
            self.last_progress = None;
            return Ok(Vec::new());
        }
        let round = self.pipeline.next_to_decode;
        match self.last_progress {
            Some((stuck_round, since)) if stuck_round == round => {
                if now.duration_since(since) >= self.params.round_timeout {
                    return Ok(self.resync(round));
                }
                Ok(Vec::new())
            }
            _ => {
                self.last_progress = Some((round, now));
                Ok(Vec::new())
            }
        }
    }

    /// Rolls every client back to `INITIALIZING` and restarts setup from
    /// the ephemeral-key exchange.
    fn resync(&mut self, stuck_round: RoundId) -> Vec<Outgoing> {
        let (missing_clients, missing_trustees) = self.pipeline.missing();
        for id in missing_clients {
            warn!(client = id, round = stuck_round, "peer missed the round deadline");
            let _ = self.events.send(RelayEvent::PeerTimeout {
                role: Role::Client,
                id,
                round: stuck_round,
            });
        }
        for id in missing_trustees {
            warn!(trustee = id, round = stuck_round, "peer missed the round deadline");
            let _ = self.events.send(RelayEvent::PeerTimeout {
                role: Role::Trustee,
                id,
                round: stuck_round,
            });
        }
        let resync_round = self.pipeline.next_downstream;
        let _ = self.events.send(RelayEvent::Resync {
            round: resync_round,
        });
        warn!(round = resync_round, "resyncing session");
        let frame = DownstreamFrame {
            round_id: resync_round,
            flag_resync: true,
            data: Vec::new(),
        };
        let mut out = Vec::new();
        for trustee in 0..self.params.n_trustees {
            out.push(Outgoing::ToTrustee(
                trustee as TrusteeId,
                Message::Downstream(frame.clone()),
            ));
        }
        out.push(Outgoing::Clients(Message::Downstream(frame)));
        self.clear_session();
        // force-reseat parameters so even a client wedged mid-setup lands
        // back in INITIALIZING, then restart from the ephemeral exchange
        // against the retained trustee set
        for client in 0..self.params.n_clients {
            let mut map = self.params.to_map();
            map.set_int(PARAM_NEXT_FREE_CLIENT_ID, client as i64);
            map.force = true;
            out.push(Outgoing::ToClient(
                client as ClientId,
                Message::Parameters(map),
            ));
        }
        out.push(Outgoing::Clients(Message::TrusteesPublicKeys {
            pks: self.trustee_pk_list(),
        }));
        self.sm.transition(RelayState::CollectingEphKeys);
        out
    }
}

/// Actor wrapper driving a [`Relay`] core from its inbox, the downstream
/// data plane, and a deadline timer.
pub struct RelayActor {
    core: Relay,
    inbox: mpsc::UnboundedReceiver<Message>,
    data_in: mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>,
    router: Arc<dyn MessageRouter>,
}

impl RelayActor {
    #[must_use]
    pub fn new(
        core: Relay,
        inbox: mpsc::UnboundedReceiver<Message>,
        data_in: mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>,
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
        let out = self.core.start()?;
        dispatch(self.router.as_ref(), out).await?;
        let mut deadline = tokio::time::interval(Duration::from_millis(100));
        deadline.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut data_open = true;
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break };
                    match self.core.handle(msg) {
                        Ok(out) => dispatch(self.router.as_ref(), out).await?,
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            warn!(%err, "relay dropped a message");
                            if self.core.state() == RelayState::Shutdown {
                                // setup abort: close the session for everyone
                                dispatch(self.router.as_ref(), self.core.shutdown_messages()).await?;
                                return Err(err);
                            }
                        }
                    }
                }
                data = self.data_in.recv(), if data_open => {
                    match data {
                        Some((connection_id, bytes)) => {
                            self.core.queue_downstream(connection_id, &bytes);
                        }
                        None => data_open = false,
                    }
                }
                _ = deadline.tick() => {
                    let out = self.core.check_deadline(Instant::now())?;
                    dispatch(self.router.as_ref(), out).await?;
                }
            }
            if self.core.state() == RelayState::Shutdown {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamsMap;
    use crate::config::{PARAM_N_CLIENTS, PARAM_N_TRUSTEES, PARAM_UPSTREAM_CELL_SIZE};

    fn test_params(n: i64, t: i64) -> SessionParams {
        let mut map = ParamsMap::new();
        map.set_int(PARAM_N_CLIENTS, n)
            .set_int(PARAM_N_TRUSTEES, t)
            .set_int(PARAM_UPSTREAM_CELL_SIZE, 32);
        SessionParams::from_map(&map).unwrap()
    }

    fn test_relay(n: i64, t: i64) -> (Relay, mpsc::UnboundedReceiver<RelayEvent>) {
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let relay = Relay::new(test_params(n, t), data_tx, event_tx).unwrap();
        (relay, event_rx)
    }

    #[test]
    fn start_seats_every_participant() {
        let (mut relay, _events) = test_relay(2, 1);
        let out = relay.start().unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(relay.state(), RelayState::CollectingPubkeys);
        assert!(relay.start().unwrap_err().is_fatal());
    }

    #[test]
    fn upstream_data_is_rejected_before_ready() {
        let (mut relay, _events) = test_relay(2, 1);
        relay.start().unwrap();
        let err = relay
            .handle(Message::UpstreamData {
                client_id: 0,
                round_id: 0,
                cipher: DcNetCipher {
                    payload: vec![0u8; 32],
                    tag: None,
                },
            })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut relay, _events) = test_relay(2, 1);
        relay.start().unwrap();
        let first = relay.handle(Message::Shutdown).unwrap();
        assert!(!first.is_empty());
        assert_eq!(relay.state(), RelayState::Shutdown);
        let second = relay.handle(Message::Shutdown).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn queued_downstream_is_slot_framed() {
        let (mut relay, _events) = test_relay(2, 1);
        relay.queue_downstream(7, b"abc");
        let framed = relay.downstream_queue.pop_front().unwrap();
        let (conn, data) = wire::parse_slot(&framed).unwrap().unwrap();
        assert_eq!(conn, 7);
        assert_eq!(data, b"abc");
    }
}
