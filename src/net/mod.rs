// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Typed protocol messages, the fixed wire encodings, and the transport
//! abstraction connecting the three roles.

mod messages;
mod router;
pub mod wire;

pub use messages::{DownstreamFrame, Message, MessageKind};
pub use router::{dispatch, LocalRouter, MessageRouter, Outgoing, TransportError};
