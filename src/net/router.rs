// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Transport abstraction between the three roles.
//!
//! All sends are non-blocking with respect to protocol logic; failures
//! surface as [`TransportError`] and the state machines translate them
//! into peer disconnects. [`LocalRouter`] wires a whole session through
//! in-process queues and models the UDP downstream variant with a
//! broadcast channel.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::messages::Message;
use crate::{ClientId, TrusteeId};

/// Capacity of the UDP-downstream broadcast ring.
const UDP_BROADCAST_CAPACITY: usize = 64;

/// Transport failures surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("relay endpoint closed")]
    RelayGone,
    #[error("client {0} endpoint closed")]
    ClientGone(ClientId),
    #[error("trustee {0} endpoint closed")]
    TrusteeGone(TrusteeId),
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("unknown trustee {0}")]
    UnknownTrustee(TrusteeId),
    #[error("no broadcast channel configured")]
    NoBroadcast,
}

/// Bidirectional message transport over the three roles.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn send_to_relay(&self, msg: Message) -> Result<(), TransportError>;
    async fn send_to_client(&self, id: ClientId, msg: Message) -> Result<(), TransportError>;
    async fn broadcast_to_clients(&self, msg: Message) -> Result<(), TransportError>;
    async fn send_to_trustee(&self, id: TrusteeId, msg: Message) -> Result<(), TransportError>;
    /// Subscription to the datagram downstream broadcast, when the
    /// transport offers one.
    fn subscribe_broadcast(&self) -> Option<broadcast::Receiver<Message>>;

    /// Best-effort datagram broadcast; transports without a datagram path
    /// report [`TransportError::NoBroadcast`].
    fn broadcast_datagram(&self, _msg: Message) -> Result<(), TransportError> {
        Err(TransportError::NoBroadcast)
    }
}

/// A message leaving a participant core, to be routed by its actor.
#[derive(Clone, Debug)]
pub enum Outgoing {
    ToRelay(Message),
    ToClient(ClientId, Message),
    ToTrustee(TrusteeId, Message),
    /// Lock-step broadcast to every client.
    Clients(Message),
    /// Datagram broadcast to subscribed clients.
    ClientsUdp(Message),
}

/// Routes a batch of outgoing messages through the transport.
pub async fn dispatch(
    router: &dyn MessageRouter,
    outgoing: Vec<Outgoing>,
) -> Result<(), TransportError> {
    for out in outgoing {
        match out {
            Outgoing::ToRelay(msg) => router.send_to_relay(msg).await?,
            Outgoing::ToClient(id, msg) => router.send_to_client(id, msg).await?,
            Outgoing::ToTrustee(id, msg) => router.send_to_trustee(id, msg).await?,
            Outgoing::Clients(msg) => router.broadcast_to_clients(msg).await?,
            Outgoing::ClientsUdp(msg) => match router.broadcast_datagram(msg) {
                Ok(()) | Err(TransportError::NoBroadcast) => {}
                Err(err) => return Err(err),
            },
        }
    }
    Ok(())
}

/// In-process router: one inbox per participant plus an optional UDP-style
/// broadcast channel.
pub struct LocalRouter {
    relay: mpsc::UnboundedSender<Message>,
    clients: Vec<mpsc::UnboundedSender<Message>>,
    trustees: Vec<mpsc::UnboundedSender<Message>>,
    udp: Option<broadcast::Sender<Message>>,
}

/// Receiving halves created alongside a [`LocalRouter`].
pub struct LocalInboxes {
    pub relay: mpsc::UnboundedReceiver<Message>,
    pub clients: Vec<mpsc::UnboundedReceiver<Message>>,
    pub trustees: Vec<mpsc::UnboundedReceiver<Message>>,
}

impl LocalRouter {
    /// Builds the router and the matching inboxes for `n` clients and `t`
    /// trustees.
    #[must_use]
    pub fn new(n_clients: usize, n_trustees: usize, use_udp: bool) -> (Self, LocalInboxes) {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (client_txs, client_rxs): (Vec<_>, Vec<_>) =
            (0..n_clients).map(|_| mpsc::unbounded_channel()).unzip();
        let (trustee_txs, trustee_rxs): (Vec<_>, Vec<_>) =
            (0..n_trustees).map(|_| mpsc::unbounded_channel()).unzip();
        let udp = use_udp.then(|| broadcast::channel(UDP_BROADCAST_CAPACITY).0);
        (
            Self {
                relay: relay_tx,
                clients: client_txs,
                trustees: trustee_txs,
                udp,
            },
            LocalInboxes {
                relay: relay_rx,
                clients: client_rxs,
                trustees: trustee_rxs,
            },
        )
    }

}

#[async_trait]
impl MessageRouter for LocalRouter {
    async fn send_to_relay(&self, msg: Message) -> Result<(), TransportError> {
        self.relay.send(msg).map_err(|_| TransportError::RelayGone)
    }

    async fn send_to_client(&self, id: ClientId, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .clients
            .get(usize::from(id))
            .ok_or(TransportError::UnknownClient(id))?;
        tx.send(msg).map_err(|_| TransportError::ClientGone(id))
    }

    async fn broadcast_to_clients(&self, msg: Message) -> Result<(), TransportError> {
        for (id, tx) in self.clients.iter().enumerate() {
            tx.send(msg.clone())
                .map_err(|_| TransportError::ClientGone(id as ClientId))?;
        }
        Ok(())
    }

    async fn send_to_trustee(&self, id: TrusteeId, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .trustees
            .get(usize::from(id))
            .ok_or(TransportError::UnknownTrustee(id))?;
        tx.send(msg).map_err(|_| TransportError::TrusteeGone(id))
    }

    fn subscribe_broadcast(&self) -> Option<broadcast::Receiver<Message>> {
        self.udp.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Drops the frame when nobody listens (datagram semantics).
    fn broadcast_datagram(&self, msg: Message) -> Result<(), TransportError> {
        let udp = self.udp.as_ref().ok_or(TransportError::NoBroadcast)?;
        let _ = udp.send(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DownstreamFrame;

    fn frame(round: u32) -> Message {
        Message::Downstream(DownstreamFrame {
            round_id: round,
            flag_resync: false,
            data: Vec::new(),
        })
    }

    #[tokio::test]
    async fn routes_to_each_role() {
        let (router, mut inboxes) = LocalRouter::new(2, 1, false);
        router.send_to_relay(frame(0)).await.unwrap();
        router.send_to_client(1, frame(1)).await.unwrap();
        router.send_to_trustee(0, frame(2)).await.unwrap();
        assert!(inboxes.relay.recv().await.is_some());
        assert!(inboxes.clients[1].recv().await.is_some());
        assert!(inboxes.trustees[0].recv().await.is_some());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (router, mut inboxes) = LocalRouter::new(3, 1, false);
        router.broadcast_to_clients(frame(5)).await.unwrap();
        for rx in &mut inboxes.clients {
            match rx.recv().await {
                Some(Message::Downstream(f)) => assert_eq!(f.round_id, 5),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_peer_surfaces_as_transport_error() {
        let (router, mut inboxes) = LocalRouter::new(1, 1, false);
        inboxes.clients.clear();
        let err = router.send_to_client(0, frame(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::ClientGone(0)));
    }

    #[tokio::test]
    async fn udp_subscription_sees_broadcast() {
        let (router, _inboxes) = LocalRouter::new(1, 1, true);
        let mut sub = router.subscribe_broadcast().unwrap();
        router.broadcast_datagram(frame(9)).unwrap();
        match sub.recv().await.unwrap() {
            Message::Downstream(f) => assert_eq!(f.round_id, 9),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn no_udp_channel_without_flag() {
        let (router, _inboxes) = LocalRouter::new(1, 1, false);
        assert!(router.subscribe_broadcast().is_none());
        assert!(matches!(
            router.broadcast_datagram(frame(0)),
            Err(TransportError::NoBroadcast)
        ));
    }
}
