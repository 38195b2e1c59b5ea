// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Veilnet is a dining-cryptographers network (DC-net) engine. A relay
//! coordinates a fixed set of clients and trustees through synchronous
//! rounds; every participant emits one fixed-size ciphertext cell per
//! round and the relay XOR-combines them to recover the plaintext slot of
//! one anonymous sender. Upstream traffic is relay-anonymous as long as at
//! least one trustee is honest; downstream traffic is broadcast to all
//! clients in lock-step.
//!
//! The crate is organized around three subsystems:
//!
//! - the setup handshake, including a trustee cascade that re-randomizes
//!   and permutes the clients' ephemeral keys ([`shuffle`]),
//! - the per-round DC-net cipher with optional equivocation protection
//!   ([`dcnet`]),
//! - the synchronous round pipeline driving relay, clients, and trustees
//!   with a bounded in-flight window ([`relay`], [`client`], [`trustee`]).
//!
//! Transport is abstracted behind [`net::MessageRouter`]; an in-memory
//! implementation wires a whole session into one process ([`session`]).

use thiserror::Error;

pub mod client;
pub mod config;
pub mod crypto;
pub mod dcnet;
pub mod net;
pub mod relay;
pub mod session;
pub mod shuffle;
pub mod state;
pub mod stats;
pub mod trustee;

pub use config::{DcNetVariant, ParamsMap, SessionParams};
pub use net::{LocalRouter, Message, MessageRouter};

/// Identifier of a client within one session.
pub type ClientId = u16;
/// Identifier of a trustee within one session.
pub type TrusteeId = u16;
/// Monotonically increasing round counter, starts at 0 each session.
pub type RoundId = u32;
/// Identifier of a data-plane connection multiplexed over the channel.
pub type ConnectionId = u32;

/// The three protocol roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Relay,
    Client,
    Trustee,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Relay => write!(f, "relay"),
            Role::Client => write!(f, "client"),
            Role::Trustee => write!(f, "trustee"),
        }
    }
}

/// Error taxonomy of the protocol engine.
///
/// `Protocol` and `Transport` are recovered at the participant actor (the
/// peer is marked disconnected and the relay may resync). `Config` is
/// reported to the caller of setup. `Crypto` failures on the shuffle abort
/// the session. `Fatal` indicates a programming error and terminates the
/// actor.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong message kind for the current state, missing contribution,
    /// signature or proof rejection.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Read/write failure, timeout, or a closed peer.
    #[error("transport: {0}")]
    Transport(String),
    /// Inconsistent session parameters.
    #[error("configuration: {0}")]
    Config(String),
    /// Unmarshal failure, slot recognition failure, pad derivation failure.
    #[error("crypto: {0}")]
    Crypto(String),
    /// Size overflow, encode for a past round, window violation.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the error must terminate the participant actor.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<net::TransportError> for Error {
    fn from(err: net::TransportError) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
