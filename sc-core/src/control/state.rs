//! Control-channel connection state.
//!
//! Provides a `ConnectionPhase` enum that models the lifecycle of the
//! control connection with validated transitions that return `Result`
//! instead of panicking, plus the per-process `ControlConnectionState`.

use std::time::Instant;

use crate::error::ScError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of the control connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Registering ──► Registered
///       ▲                │               │              │
///       │                ▼               ▼              ▼
///       └──────── Disconnecting ◄────────┴──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// Transport connection initiated but not yet established.
    Connecting,

    /// Transport is up; `register` sent, waiting for `registered`.
    Registering,

    /// Handshake complete; heartbeats and requests flow.
    Registered {
        /// When the connection entered the `Registered` state.
        since: Instant,
    },

    /// Teardown in progress.
    Disconnecting,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Registering => write!(f, "Registering"),
            Self::Registered { .. } => write!(f, "Registered"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl ConnectionPhase {
    /// Returns `true` when the connection is registered and usable.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the connection has been registered.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Registered { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), ScError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            other => Err(ScError::Protocol(format!(
                "cannot connect while {other}"
            ))),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_register(&mut self) -> Result<(), ScError> {
        match self {
            Self::Connecting => {
                *self = Self::Registering;
                Ok(())
            }
            other => Err(ScError::Protocol(format!(
                "cannot register while {other}"
            ))),
        }
    }

    /// Valid from: `Registering`.
    pub fn complete_register(&mut self) -> Result<(), ScError> {
        match self {
            Self::Registering => {
                *self = Self::Registered {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(ScError::Protocol(format!(
                "cannot complete registration while {other}"
            ))),
        }
    }

    /// Start teardown. Returns `false` if there was nothing to tear down.
    pub fn begin_disconnect(&mut self) -> bool {
        match self {
            Self::Disconnected | Self::Disconnecting => false,
            _ => {
                *self = Self::Disconnecting;
                true
            }
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── ControlConnectionState ───────────────────────────────────────

/// Registration status as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    #[default]
    Unregistered,
    Registered,
}

/// One per agent process; owned by the control channel.
#[derive(Debug, Clone, Default)]
pub struct ControlConnectionState {
    pub phase: ConnectionPhase,
    pub registration: RegistrationStatus,
    pub agent_id: Option<String>,
    pub license_status: String,
    pub reconnect_attempts: u32,
    pub server_url: String,
    pub connect_on_startup: bool,
}

impl ControlConnectionState {
    pub fn new(server_url: impl Into<String>, connect_on_startup: bool) -> Self {
        Self {
            server_url: server_url.into(),
            connect_on_startup,
            ..Default::default()
        }
    }

    /// Record a successful `registered` reply.
    pub fn mark_registered(&mut self, agent_id: String, license_status: String) {
        self.registration = RegistrationStatus::Registered;
        self.agent_id = Some(agent_id);
        self.license_status = license_status;
    }

    /// Drop back to unregistered after the transport went away.
    pub fn mark_disconnected(&mut self) {
        self.phase.force_disconnect();
        self.registration = RegistrationStatus::Unregistered;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = ConnectionPhase::Disconnected;

        phase.begin_connect().unwrap();
        assert_eq!(phase, ConnectionPhase::Connecting);

        phase.begin_register().unwrap();
        assert_eq!(phase, ConnectionPhase::Registering);

        phase.complete_register().unwrap();
        assert!(phase.is_registered());
        assert!(phase.connected_duration().is_some());

        assert!(phase.begin_disconnect());
        assert_eq!(phase, ConnectionPhase::Disconnecting);

        phase.force_disconnect();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn connect_when_registered_is_rejected() {
        let mut phase = ConnectionPhase::Registered {
            since: Instant::now(),
        };
        assert!(phase.begin_connect().is_err());
    }

    #[test]
    fn register_from_disconnected_is_rejected() {
        let mut phase = ConnectionPhase::Disconnected;
        assert!(phase.begin_register().is_err());
        assert!(phase.complete_register().is_err());
    }

    #[test]
    fn repeated_disconnect_is_noop() {
        let mut phase = ConnectionPhase::Disconnected;
        assert!(!phase.begin_disconnect());
        assert!(!phase.begin_disconnect());
        assert!(phase.is_disconnected());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionPhase::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionPhase::Registering.to_string(), "Registering");
        assert_eq!(
            ConnectionPhase::Registered {
                since: Instant::now()
            }
            .to_string(),
            "Registered"
        );
    }

    #[test]
    fn state_registration_roundtrip() {
        let mut state = ControlConnectionState::new("wss://cp/ws", true);
        assert_eq!(state.registration, RegistrationStatus::Unregistered);
        state.mark_registered("agent-9".into(), "active".into());
        assert_eq!(state.registration, RegistrationStatus::Registered);
        assert_eq!(state.agent_id.as_deref(), Some("agent-9"));
        state.mark_disconnected();
        assert_eq!(state.registration, RegistrationStatus::Unregistered);
        assert!(state.phase.is_disconnected());
        // Assigned id is kept across disconnects.
        assert_eq!(state.agent_id.as_deref(), Some("agent-9"));
    }
}
