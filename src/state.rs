// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Per-role finite-state machines.
//!
//! Every role rejects a message whose kind is not legal in its current
//! state; rejection is non-fatal (the message is dropped and logged), with
//! one exception: a `Parameters` message carrying the `force` flag
//! re-seats the configuration and jumps the machine back to its
//! initializing state. A `Shutdown` from the relay is accepted
//! unconditionally.

use std::fmt;

use tracing::{debug, warn};

use crate::net::MessageKind;
use crate::{Error, Result};

/// A role's state enumeration with its allowed-message table.
pub trait RoleState: Copy + Eq + fmt::Display {
    fn accepts(self, kind: MessageKind) -> bool;
}

/// Relay lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    BeforeInit,
    CollectingPubkeys,
    CollectingEphKeys,
    Shuffling,
    Ready,
    Shutdown,
}

impl RoleState for RelayState {
    fn accepts(self, kind: MessageKind) -> bool {
        if kind == MessageKind::Shutdown {
            return true;
        }
        match self {
            RelayState::BeforeInit => kind == MessageKind::Parameters,
            RelayState::CollectingPubkeys => kind == MessageKind::TrusteePublicKey,
            RelayState::CollectingEphKeys => kind == MessageKind::ClientKeys,
            RelayState::Shuffling => {
                matches!(
                    kind,
                    MessageKind::TrusteeShuffled | MessageKind::TrusteeShuffleSig
                )
            }
            RelayState::Ready => {
                matches!(kind, MessageKind::UpstreamData | MessageKind::TrusteeCipher)
            }
            RelayState::Shutdown => false,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::BeforeInit => "BEFORE_INIT",
            RelayState::CollectingPubkeys => "COLLECTING_PUBKEYS",
            RelayState::CollectingEphKeys => "COLLECTING_EPHKEYS",
            RelayState::Shuffling => "SHUFFLING",
            RelayState::Ready => "READY",
            RelayState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Client lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    BeforeInit,
    Initializing,
    EphKeysSent,
    Ready,
    Shutdown,
}

impl RoleState for ClientState {
    fn accepts(self, kind: MessageKind) -> bool {
        if kind == MessageKind::Shutdown {
            return true;
        }
        match self {
            ClientState::BeforeInit => kind == MessageKind::Parameters,
            ClientState::Initializing => kind == MessageKind::TrusteesPublicKeys,
            ClientState::EphKeysSent => kind == MessageKind::ShuffleResult,
            ClientState::Ready => {
                matches!(kind, MessageKind::Downstream | MessageKind::DownstreamUdp)
            }
            ClientState::Shutdown => false,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::BeforeInit => "BEFORE_INIT",
            ClientState::Initializing => "INITIALIZING",
            ClientState::EphKeysSent => "EPH_KEYS_SENT",
            ClientState::Ready => "READY",
            ClientState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Trustee lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrusteeState {
    BeforeInit,
    Initializing,
    Shuffling,
    Ready,
    Shutdown,
}

impl RoleState for TrusteeState {
    fn accepts(self, kind: MessageKind) -> bool {
        if kind == MessageKind::Shutdown {
            return true;
        }
        match self {
            TrusteeState::BeforeInit => kind == MessageKind::Parameters,
            TrusteeState::Initializing => kind == MessageKind::ShuffleRequest,
            TrusteeState::Shuffling => kind == MessageKind::ShuffleTranscript,
            // a new ShuffleRequest in READY starts the post-resync setup
            TrusteeState::Ready => {
                matches!(kind, MessageKind::Downstream | MessageKind::ShuffleRequest)
            }
            TrusteeState::Shutdown => false,
        }
    }
}

impl fmt::Display for TrusteeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrusteeState::BeforeInit => "BEFORE_INIT",
            TrusteeState::Initializing => "INITIALIZING",
            TrusteeState::Shuffling => "SHUFFLING",
            TrusteeState::Ready => "READY",
            TrusteeState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Wrapper holding a role's current state and logging transitions.
#[derive(Debug)]
pub struct StateMachine<S: RoleState> {
    role: &'static str,
    current: S,
}

impl<S: RoleState> StateMachine<S> {
    #[must_use]
    pub fn new(role: &'static str, initial: S) -> Self {
        Self {
            role,
            current: initial,
        }
    }

    #[must_use]
    pub fn current(&self) -> S {
        self.current
    }

    #[must_use]
    pub fn can_receive(&self, kind: MessageKind) -> bool {
        self.current.accepts(kind)
    }

    /// Non-fatal rejection of an out-of-state message.
    pub fn expect(&self, kind: MessageKind) -> Result<()> {
        if self.current.accepts(kind) {
            Ok(())
        } else {
            warn!(role = self.role, state = %self.current, message = %kind, "dropping out-of-state message");
            Err(Error::Protocol(format!(
                "{} cannot receive {kind} in state {}",
                self.role, self.current
            )))
        }
    }

    pub fn transition(&mut self, next: S) {
        if self.current != next {
            debug!(role = self.role, from = %self.current, to = %next, "state transition");
            self.current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_table_matches_lifecycle() {
        let sm = StateMachine::new("relay", RelayState::BeforeInit);
        assert!(sm.can_receive(MessageKind::Parameters));
        assert!(!sm.can_receive(MessageKind::UpstreamData));

        let sm = StateMachine::new("relay", RelayState::Ready);
        assert!(sm.can_receive(MessageKind::UpstreamData));
        assert!(sm.can_receive(MessageKind::TrusteeCipher));
        assert!(!sm.can_receive(MessageKind::ClientKeys));
    }

    #[test]
    fn shutdown_is_always_accepted() {
        for state in [
            ClientState::BeforeInit,
            ClientState::Initializing,
            ClientState::EphKeysSent,
            ClientState::Ready,
        ] {
            assert!(state.accepts(MessageKind::Shutdown));
        }
        assert!(RelayState::Shuffling.accepts(MessageKind::Shutdown));
        assert!(TrusteeState::Shuffling.accepts(MessageKind::Shutdown));
    }

    #[test]
    fn rejection_is_an_error_but_not_fatal() {
        let sm = StateMachine::new("client", ClientState::Initializing);
        let err = sm.expect(MessageKind::Downstream).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn transition_updates_current() {
        let mut sm = StateMachine::new("trustee", TrusteeState::BeforeInit);
        sm.transition(TrusteeState::Initializing);
        assert_eq!(sm.current(), TrusteeState::Initializing);
    }
}
