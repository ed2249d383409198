//! Control-protocol envelopes.
//!
//! Every message is a JSON object with a `type` discriminator. Type names
//! are snake_case, field names camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ScError;
use crate::machine::{Fingerprint, MachineInfo};

// ── UpdateFlag ───────────────────────────────────────────────────

/// Update hint carried by `heartbeat_ack`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateFlag {
    #[default]
    None = 0,
    Available = 1,
    Forced = 2,
}

impl TryFrom<u8> for UpdateFlag {
    type Error = ScError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UpdateFlag::None),
            1 => Ok(UpdateFlag::Available),
            2 => Ok(UpdateFlag::Forced),
            _ => Err(ScError::UnknownVariant {
                type_name: "UpdateFlag",
                value: value as u64,
            }),
        }
    }
}

impl UpdateFlag {
    /// Lenient conversion for wire values: unknown flags count as none.
    pub fn from_wire(value: u8) -> Self {
        Self::try_from(value).unwrap_or_default()
    }

    pub fn wants_check(self) -> bool {
        !matches!(self, UpdateFlag::None)
    }
}

// ── Payloads ─────────────────────────────────────────────────────

/// Body of the outbound `register` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub machine_id: String,
    pub machine_name: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub fingerprint: FingerprintWire,
}

impl Registration {
    /// Registration for this machine; the name defaults to the hostname.
    pub fn from_machine(
        machine: MachineInfo,
        machine_name: Option<String>,
        agent_version: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine.machine_id,
            machine_name: machine_name.unwrap_or_else(|| machine.fingerprint.hostname.clone()),
            os_type: machine.os_type,
            os_version: machine.os_version,
            arch: machine.arch,
            agent_version: agent_version.into(),
            license_id: None,
            customer_id: None,
            fingerprint: machine.fingerprint.into(),
        }
    }
}

/// Wire form of [`Fingerprint`]; kept separate so the message can be
/// deserialized in tests and relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintWire {
    pub hostname: String,
    pub cpu_model: String,
    pub mac_addresses: Vec<String>,
}

impl From<Fingerprint> for FingerprintWire {
    fn from(f: Fingerprint) -> Self {
        Self {
            hostname: f.hostname,
            cpu_model: f.cpu_model,
            mac_addresses: f.mac_addresses,
        }
    }
}

/// Server-provided settings returned with `registered`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Heartbeat period in seconds.
    pub heartbeat_interval: Option<u64>,
    /// Anything else the server sends is kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── ControlMessage ───────────────────────────────────────────────

/// All messages exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Agent → server, once per connection.
    Register(Registration),

    /// Server → agent, handshake reply.
    #[serde(rename_all = "camelCase")]
    Registered {
        agent_id: String,
        #[serde(default)]
        license_status: String,
        #[serde(default)]
        config: Option<ServerConfig>,
    },

    /// Agent → server, periodic.
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        timestamp: i64,
        power_state: String,
        is_screen_locked: bool,
    },

    /// Server → agent, reply to `heartbeat`.
    #[serde(rename_all = "camelCase")]
    HeartbeatAck {
        #[serde(default)]
        license_status: String,
        #[serde(default)]
        update_flag: u8,
    },

    /// Server → agent command.
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Agent → server reply to `request`.
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Application-level keepalive.
    Ping {
        #[serde(default)]
        timestamp: i64,
    },

    /// Reply to `ping`.
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}

impl ControlMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ScError> {
        serde_json::from_str(text).map_err(|e| ScError::Protocol(format!("bad message: {e}")))
    }

    /// Serialize to the text frame sent on the wire.
    pub fn to_json(&self) -> Result<String, ScError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Build the response for a finished request.
    pub fn response(id: impl Into<String>, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => ControlMessage::Response {
                id: id.into(),
                result: Some(result),
                error: None,
            },
            Err(error) => ControlMessage::Response {
                id: id.into(),
                result: None,
                error: Some(error),
            },
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Register(_) => "register",
            ControlMessage::Registered { .. } => "registered",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ControlMessage::Request { .. } => "request",
            ControlMessage::Response { .. } => "response",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_flag_conversion() {
        assert_eq!(UpdateFlag::try_from(2).unwrap(), UpdateFlag::Forced);
        assert!(UpdateFlag::try_from(7).is_err());
        assert_eq!(UpdateFlag::from_wire(7), UpdateFlag::None);
        assert!(UpdateFlag::Available.wants_check());
        assert!(!UpdateFlag::None.wants_check());
    }

    #[test]
    fn parses_registered_with_config() {
        let msg = ControlMessage::parse(
            r#"{"type":"registered","agentId":"a-1","licenseStatus":"active","config":{"heartbeatInterval":15,"region":"eu"}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::Registered {
                agent_id,
                license_status,
                config,
            } => {
                assert_eq!(agent_id, "a-1");
                assert_eq!(license_status, "active");
                let config = config.unwrap();
                assert_eq!(config.heartbeat_interval, Some(15));
                assert_eq!(config.extra["region"], "eu");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_heartbeat_ack() {
        let msg =
            ControlMessage::parse(r#"{"type":"heartbeat_ack","licenseStatus":"active","updateFlag":2}"#)
                .unwrap();
        assert_eq!(
            msg,
            ControlMessage::HeartbeatAck {
                license_status: "active".into(),
                update_flag: 2
            }
        );
    }

    #[test]
    fn request_without_params_defaults_to_null() {
        let msg = ControlMessage::parse(r#"{"type":"request","id":"7","method":"ping"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Request {
                id: "7".into(),
                method: "ping".into(),
                params: Value::Null
            }
        );
    }

    #[test]
    fn response_shapes() {
        let ok = ControlMessage::response("1", Ok(json!({"pong": true})));
        let v: Value = serde_json::from_str(&ok.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "response", "id": "1", "result": {"pong": true}}));

        let err = ControlMessage::response("2", Err("boom".into()));
        let v: Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "response", "id": "2", "error": "boom"}));
    }

    #[test]
    fn heartbeat_field_names() {
        let hb = ControlMessage::Heartbeat {
            timestamp: 1,
            power_state: "ac".into(),
            is_screen_locked: false,
        };
        let v: Value = serde_json::from_str(&hb.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "heartbeat");
        assert_eq!(v["powerState"], "ac");
        assert_eq!(v["isScreenLocked"], false);
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = ControlMessage::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ScError::Protocol(_)));
    }
}
