// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! In-process session wiring: one relay, N clients, and T trustees over a
//! [`LocalRouter`]. Used by the CLI binary and by the end-to-end tests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{Client, ClientActor};
use crate::config::SessionParams;
use crate::net::LocalRouter;
use crate::relay::{Relay, RelayActor, RelayEvent};
use crate::trustee::{Trustee, TrusteeActor};
use crate::{ClientId, ConnectionId, Result, TrusteeId};

/// Handles into a running local session.
pub struct SessionHandles {
    pub router: Arc<dyn crate::net::MessageRouter>,
    /// Relay lifecycle events (ready, timeouts, resync).
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
    /// Feed for the relay's downstream data plane.
    pub relay_data_in: mpsc::UnboundedSender<(ConnectionId, Vec<u8>)>,
    /// Decoded upstream slots, keyed by connection id.
    pub relay_data_out: mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>,
    /// Per-client feeds into the anonymous channel (slot-framed bytes).
    pub client_data_in: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    /// Per-client downstream data taps.
    pub client_data_out: Vec<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// The actor tasks, relay first.
    pub tasks: Vec<JoinHandle<Result<()>>>,
}

/// Spawns a complete session on the current tokio runtime.
pub fn spawn_local_session(params: &SessionParams) -> Result<SessionHandles> {
    let (router, inboxes) = LocalRouter::new(params.n_clients, params.n_trustees, params.use_udp);
    let router: Arc<dyn crate::net::MessageRouter> = Arc::new(router);
    let mut tasks = Vec::new();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (relay_data_in_tx, relay_data_in_rx) = mpsc::unbounded_channel();
    let (relay_data_out_tx, relay_data_out_rx) = mpsc::unbounded_channel();
    let relay = Relay::new(params.clone(), relay_data_out_tx, event_tx)?;
    tasks.push(tokio::spawn(
        RelayActor::new(relay, inboxes.relay, relay_data_in_rx, Arc::clone(&router)).run(),
    ));

    let mut client_data_in = Vec::with_capacity(params.n_clients);
    let mut client_data_out = Vec::with_capacity(params.n_clients);
    for (id, inbox) in inboxes.clients.into_iter().enumerate() {
        let (data_in_tx, data_in_rx) = mpsc::unbounded_channel();
        let (data_out_tx, data_out_rx) = mpsc::unbounded_channel();
        let core = Client::new(id as ClientId, data_out_tx);
        tasks.push(tokio::spawn(
            ClientActor::new(core, inbox, data_in_rx, Arc::clone(&router)).run(),
        ));
        client_data_in.push(data_in_tx);
        client_data_out.push(data_out_rx);
    }

    for (id, inbox) in inboxes.trustees.into_iter().enumerate() {
        let core = Trustee::new(id as TrusteeId);
        tasks.push(tokio::spawn(
            TrusteeActor::new(core, inbox, Arc::clone(&router)).run(),
        ));
    }

    Ok(SessionHandles {
        router,
        events: event_rx,
        relay_data_in: relay_data_in_tx,
        relay_data_out: relay_data_out_rx,
        client_data_in,
        client_data_out,
        tasks,
    })
}
