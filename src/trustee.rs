// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Trustee participant.
//!
//! A trustee owns a long-term key pair that persists across sessions. Per
//! session it derives one pad seed per client, performs its step of the
//! shuffle cascade, signs the final transcript, and then emits one DC-net
//! cell per round. Cell production is clocked by the relay's downstream
//! frames, which also carry the history that equivocation protection
//! binds to; the pipeline window therefore bounds how far a trustee runs
//! ahead of decoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ParamsMap, SessionParams, PARAM_NEXT_FREE_TRUSTEE_ID};
use crate::crypto::{pad_seed, shared_secret, KeyPair};
use crate::dcnet::{CodecRole, DcNetCodec};
use crate::net::{dispatch, DownstreamFrame, Message, MessageRouter, Outgoing};
use crate::shuffle::{shuffle_step, sign_transcript};
use crate::state::{StateMachine, TrusteeState};
use crate::{Error, Result, RoundId, TrusteeId};

/// Protocol core of one trustee; all state mutation happens here, on the
/// owning actor's task.
pub struct Trustee {
    id: TrusteeId,
    long_term: KeyPair,
    sm: StateMachine<TrusteeState>,
    params: Option<SessionParams>,
    codec: Option<DcNetCodec>,
    round_no: RoundId,
    buffered: BTreeMap<RoundId, DownstreamFrame>,
}

impl Trustee {
    #[must_use]
    pub fn new(id: TrusteeId) -> Self {
        let mut rng = OsRng;
        Self {
            id,
            long_term: KeyPair::generate(&mut rng),
            sm: StateMachine::new("trustee", TrusteeState::BeforeInit),
            params: None,
            codec: None,
            round_no: 0,
            buffered: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TrusteeId {
        self.id
    }

    #[must_use]
    pub fn public_key(&self) -> RistrettoPoint {
        self.long_term.public()
    }

    #[must_use]
    pub fn state(&self) -> TrusteeState {
        self.sm.current()
    }

    fn params(&self) -> Result<&SessionParams> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::Fatal("session parameters not seated".into()))
    }

    fn clear_session(&mut self) {
        // pad streams and their seeds are zeroized on drop
        self.codec = None;
        self.round_no = 0;
        self.buffered.clear();
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
                self.sm.transition(TrusteeState::Shutdown);
                self.clear_session();
                Ok(Vec::new())
            }
            Message::ShuffleRequest {
                base,
                eph_pks,
                client_pks,
            } => {
                self.sm.expect(kind)?;
                self.start_shuffle(&base, &eph_pks, &client_pks)
            }
            Message::ShuffleTranscript { base, eph_pks } => {
                self.sm.expect(kind)?;
                let mut rng = OsRng;
                let signature =
                    sign_transcript(self.long_term.secret(), &base, &eph_pks, &mut rng);
                self.sm.transition(TrusteeState::Ready);
                self.round_no = 0;
                info!(trustee = self.id, "transcript signed, ready for rounds");
                Ok(vec![Outgoing::ToRelay(Message::TrusteeShuffleSig {
                    trustee_id: self.id,
                    signature,
                })])
            }
            Message::Downstream(frame) => {
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
        let id = map.int_or(PARAM_NEXT_FREE_TRUSTEE_ID, -1);
        if id >= 0 {
            self.id = id as TrusteeId;
        }
        self.params = Some(params);
        self.clear_session();
        self.sm.transition(TrusteeState::Initializing);
        Ok(vec![Outgoing::ToRelay(Message::TrusteePublicKey {
            trustee_id: self.id,
            pk: self.long_term.public(),
        })])
    }

    fn start_shuffle(
        &mut self,
        base: &RistrettoPoint,
        eph_pks: &[RistrettoPoint],
        client_pks: &[RistrettoPoint],
    ) -> Result<Vec<Outgoing>> {
        let params = self.params()?.clone();
        if client_pks.len() != params.n_clients || eph_pks.len() != params.n_clients {
            return Err(Error::Protocol(format!(
                "shuffle request carries {} keys for {} clients",
                client_pks.len(),
                params.n_clients
            )));
        }
        self.clear_session();
        let mut rng = OsRng;
        let seeds = client_pks
            .iter()
            .map(|pk| pad_seed(&shared_secret(self.long_term.secret(), pk)))
            .collect();
        self.codec = Some(DcNetCodec::new(
            CodecRole::Trustee,
            params.payload_size,
            params.equivocation,
            seeds,
            &mut rng,
        )?);
        let step = shuffle_step(&mut rng, base, eph_pks);
        self.sm.transition(TrusteeState::Shuffling);
        Ok(vec![Outgoing::ToRelay(Message::TrusteeShuffled {
            trustee_id: self.id,
            step,
        })])
    }

    fn on_downstream(&mut self, frame: DownstreamFrame) -> Result<Vec<Outgoing>> {
        // a resync rolls the session back no matter where the round
        // counter stands
        if frame.flag_resync {
            return self.process_frame(frame);
        }
        if frame.round_id < self.round_no {
            warn!(
                trustee = self.id,
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
                    warn!(trustee = self.id, round = oldest, "reorder buffer full, dropping oldest frame");
                }
            }
            return Ok(Vec::new());
        }
        let mut out = self.process_frame(frame)?;
        while let Some(frame) = self.buffered.remove(&self.round_no) {
            out.extend(self.process_frame(frame)?);
        }
        Ok(out)
    }

    fn process_frame(&mut self, frame: DownstreamFrame) -> Result<Vec<Outgoing>> {
        if frame.flag_resync {
            info!(trustee = self.id, "relay requested resync");
            self.clear_session();
            self.sm.transition(TrusteeState::Initializing);
            return Ok(Vec::new());
        }
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| Error::Fatal("downstream frame before codec setup".into()))?;
        codec.update_history(&frame.data);
        let cipher = codec.encode_trustee(frame.round_id)?;
        self.round_no = frame.round_id + 1;
        Ok(vec![Outgoing::ToRelay(Message::TrusteeCipher {
            trustee_id: self.id,
            round_id: frame.round_id,
            cipher,
        })])
    }
}

/// Actor wrapper driving a [`Trustee`] core from its inbox.
pub struct TrusteeActor {
    core: Trustee,
    inbox: mpsc::UnboundedReceiver<Message>,
    router: Arc<dyn MessageRouter>,
}

impl TrusteeActor {
    #[must_use]
    pub fn new(
        core: Trustee,
        inbox: mpsc::UnboundedReceiver<Message>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        Self {
            core,
            inbox,
            router,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(msg) = self.inbox.recv().await {
            match self.core.handle(msg) {
                Ok(out) => dispatch(self.router.as_ref(), out).await?,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(trustee = self.core.id(), %err, "message dropped"),
            }
            if self.core.state() == TrusteeState::Shutdown {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        PARAM_N_CLIENTS, PARAM_N_TRUSTEES, PARAM_UPSTREAM_CELL_SIZE,
    };

    fn params_map() -> ParamsMap {
        let mut map = ParamsMap::new();
        map.set_int(PARAM_N_CLIENTS, 2)
            .set_int(PARAM_N_TRUSTEES, 1)
            .set_int(PARAM_UPSTREAM_CELL_SIZE, 32);
        map
    }

    #[test]
    fn announces_its_key_on_parameters() {
        let mut trustee = Trustee::new(0);
        let out = trustee.handle(Message::Parameters(params_map())).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Outgoing::ToRelay(Message::TrusteePublicKey { trustee_id: 0, .. })
        ));
        assert_eq!(trustee.state(), TrusteeState::Initializing);
    }

    #[test]
    fn rejects_downstream_before_setup() {
        let mut trustee = Trustee::new(0);
        let err = trustee
            .handle(Message::Downstream(DownstreamFrame::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(trustee.state(), TrusteeState::BeforeInit);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut trustee = Trustee::new(0);
        trustee.handle(Message::Shutdown).unwrap();
        assert_eq!(trustee.state(), TrusteeState::Shutdown);
        trustee.handle(Message::Shutdown).unwrap();
        assert_eq!(trustee.state(), TrusteeState::Shutdown);
    }

    #[test]
    fn forced_parameters_reseat_from_any_state() {
        let mut trustee = Trustee::new(0);
        trustee.handle(Message::Parameters(params_map())).unwrap();
        let mut forced = params_map();
        forced.force = true;
        trustee.handle(Message::Parameters(forced)).unwrap();
        assert_eq!(trustee.state(), TrusteeState::Initializing);
    }
}
