//! Messages exchanged with the cloud control channel.
//!
//! Every websocket text frame carries one JSON envelope
//! `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::DoorState;

/// Category of a `report` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Success,
    Reject,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "type")]
    pub kind: LogType,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image: Option<String>,
}

impl Report {
    pub fn new(kind: LogType, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            image: None,
        }
    }
}

/// Events sent to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    DoorStatus(DoorState),
    Report(Report),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::DoorStatus(_) => "door_status",
            OutboundEvent::Report(_) => "report",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CommandPayload {
    cmd: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum InboundEnvelope {
    Command(CommandPayload),
}

/// Command pushed by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Open,
    Close,
    /// The raw user id; validation happens when it is turned into a sensor command.
    RegisterFace(String),
    Refresh,
}

impl RemoteCommand {
    /// Decodes one inbound text frame. Anything other than a known `command`
    /// is logged and ignored.
    pub fn decode(text: &str) -> Option<Self> {
        let envelope: InboundEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "ignoring unrecognized remote message");
                return None;
            }
        };
        let InboundEnvelope::Command(payload) = envelope;
        match payload.cmd.as_str() {
            "OPEN" => Some(RemoteCommand::Open),
            "CLOSE" => Some(RemoteCommand::Close),
            "REGISTER_FACE" => Some(RemoteCommand::RegisterFace(payload.user_id.unwrap_or_default())),
            "REFRESH" => Some(RemoteCommand::Refresh),
            other => {
                warn!(cmd = other, "ignoring unsupported remote command");
                None
            }
        }
    }
}

impl OutboundEvent {
    pub fn encode(&self) -> String {
        // Both variants are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
