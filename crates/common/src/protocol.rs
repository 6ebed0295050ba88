use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Label the sensor module reports for a face it cannot match.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Sensor feature selected with `START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureId {
    Detect,
    Recognize,
}

impl FeatureId {
    pub fn code(self) -> u8 {
        match self {
            FeatureId::Detect => 6,
            FeatureId::Recognize => 8,
        }
    }
}

/// A user id accepted by `REGCAM`/`DELETE`.
///
/// Non-empty and free of the framing characters `$`, `#` and `,`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::EmptyUserId);
        }
        if let Some(c) = trimmed.chars().find(|c| matches!(c, '$' | '#' | ',')) {
            return Err(ProtocolError::ReservedCharacter(c));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command sent to the sensor module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    Start(FeatureId),
    Stop,
    RegisterFace(UserId),
    DeleteUser(UserId),
    ListUsers,
    ReloadDb,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Status => "STATUS",
            Command::Start(_) => "START",
            Command::Stop => "STOP",
            Command::RegisterFace(_) => "REGCAM",
            Command::DeleteUser(_) => "DELETE",
            Command::ListUsers => "LIST",
            Command::ReloadDb => "RELOAD",
        }
    }

    /// How long the module may take before the command counts as unanswered.
    /// Starting a feature loads a model and registration waits for a capture.
    pub fn reply_timeout_ms(&self) -> u64 {
        match self {
            Command::Start(_) => 10_000,
            Command::RegisterFace(_) => 15_000,
            Command::Stop | Command::ReloadDb => 5_000,
            _ => 2_000,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start(feature) => write!(f, "START({})", feature.code()),
            Command::RegisterFace(user) | Command::DeleteUser(user) => {
                write!(f, "{}({})", self.name(), user)
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub bbox: BoundingBox,
    pub label: String,
    /// 0..=100
    pub score: u8,
}

impl RecognitionEvent {
    pub fn is_known(&self) -> bool {
        self.label != UNKNOWN_LABEL && self.score > 0
    }
}

/// Typed message decoded from the sensor link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorMessage {
    Pong { info: Vec<String> },
    StatusReply { mode: u8, detail: String },
    Detection(BoundingBox),
    Recognition(RecognitionEvent),
    Ack { data: Vec<String> },
    Error { message: String },
    /// Unsolicited result of a capture started by `REGCAM`.
    Registration { user: String, saved: bool, detail: String },
    /// Unsolicited module fault.
    Fault { code: i64, message: String },
}

impl SensorMessage {
    /// `$RSP` replies resolve the oldest command awaiting an answer; events
    /// never do.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            SensorMessage::Pong { .. } | SensorMessage::Ack { .. } | SensorMessage::Error { .. }
        )
    }
}
