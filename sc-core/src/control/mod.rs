//! Control channel: protocol envelopes, connection state, reconnect policy
//! and the WebSocket client that ties them together.

pub mod backoff;
pub mod channel;
pub mod message;
pub mod state;

pub use backoff::{ReconnectBackoff, reconnect_delay};
pub use channel::{ChannelConfig, CommandHandler, ControlChannel, ControlEvent};
pub use message::{ControlMessage, FingerprintWire, Registration, ServerConfig, UpdateFlag};
pub use state::{ConnectionPhase, ControlConnectionState, RegistrationStatus};
