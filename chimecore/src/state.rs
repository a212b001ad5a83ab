//! Connection lifecycle state.

use std::fmt;

/// Lifecycle of one signaling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Dialing the signaling endpoint for the first time.
    Connecting,
    /// Transport is up, JOIN not sent yet.
    Connected,
    /// JOIN sent, waiting for JOIN_ACK.
    Authenticating,
    Joined,
    /// Transport lost; dialing again with backoff.
    Reconnecting,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn is_joined(self) -> bool {
        self == Self::Joined
    }

    /// States in which a live transport may be lost.
    pub fn has_transport(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticating | Self::Joined
        )
    }

    /// Computes the state after `transition`, or reports why it is not allowed.
    pub fn apply(self, transition: StateTransition) -> Result<Self, InvalidTransition> {
        use ConnectionState::*;
        use StateTransition::*;

        let next = match (self, transition) {
            (Disconnected, Start) => Connecting,
            (Connecting, TransportUp) => Connected,
            (Reconnecting, TransportUp) => Authenticating,
            (Connected, JoinSent) => Authenticating,
            (Authenticating, JoinAccepted) => Joined,
            (current, TransportLost) if current.has_transport() || current == Reconnecting => {
                Reconnecting
            }
            (current, Leave | RemoteLeave) if !current.is_terminal() => Closed,
            (current, Fail) if !current.is_terminal() => Failed,
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: current,
                    attempted,
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Joined => "joined",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs that move the lifecycle forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    Start,
    TransportUp,
    JoinSent,
    JoinAccepted,
    TransportLost,
    Leave,
    RemoteLeave,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: ConnectionState,
    pub attempted: StateTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use StateTransition::*;

    fn run(mut state: ConnectionState, transitions: &[StateTransition]) -> ConnectionState {
        for t in transitions {
            state = state.apply(*t).unwrap();
        }
        state
    }

    /// Flow: Disconnected → Connecting → Connected → Authenticating → Joined → Closed
    #[test]
    fn test_happy_path() {
        let joined = run(Disconnected, &[Start, TransportUp, JoinSent, JoinAccepted]);
        assert_eq!(joined, Joined);
        assert_eq!(joined.apply(Leave).unwrap(), Closed);
    }

    /// Flow: Joined → Reconnecting → Authenticating → Joined
    #[test]
    fn test_reconnect_replays_authentication() {
        let state = run(Joined, &[TransportLost, TransportLost]);
        assert_eq!(state, Reconnecting);
        let state = run(state, &[TransportUp, JoinAccepted]);
        assert_eq!(state, Joined);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Closed, Failed] {
            for t in [Start, TransportUp, JoinSent, JoinAccepted, TransportLost, Leave, Fail] {
                let err = terminal.apply(t).unwrap_err();
                assert_eq!(err.current_state, terminal);
            }
        }
    }

    #[test]
    fn test_leave_always_closes_live_states() {
        for state in [Disconnected, Connecting, Connected, Authenticating, Joined, Reconnecting] {
            assert_eq!(state.apply(Leave).unwrap(), Closed);
        }
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Disconnected.apply(JoinAccepted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid transition JoinAccepted in state disconnected"
        );
    }
}
