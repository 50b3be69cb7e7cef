// Message types exchanged with the command adapters

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::arm::{GripState, JointId};

// Range accepted from local requests, before the joint's own clamp
pub const REQUEST_MIN_ANGLE: i64 = 0;
pub const REQUEST_MAX_ANGLE: i64 = 180;

/// Arm state reported to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmSnapshot {
    pub grip: GripState,
    pub elbow: i32,
    pub shoulder: i32,
    pub base: i32,
}

/// One core operation requested by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmCommand {
    SetJoint(JointId, i32),
    MoveJoint(JointId, i32),
    OpenGrip,
    CloseGrip,
}

// Local request -> runtime, e.g. {"servo": "elbow", "value": 80}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointRequest {
    pub servo: String,
    pub value: i64,
}

/// Why a local request was refused
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Missing request payload")]
    Empty,

    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid servo '{0}'. Must be one of elbow, grip, base, shoulder")]
    UnknownServo(String),

    #[error("Invalid value. Must be between 0 and 180 degree")]
    OutOfRange(i64),

    #[error("Arm error: {0}")]
    Arm(String),
}

impl JointRequest {
    /// Validate and turn into a core command. Grip: any positive value
    /// opens, zero closes.
    pub fn to_command(&self) -> Result<ArmCommand, RequestError> {
        let joint: JointId = self
            .servo
            .parse()
            .map_err(|_| RequestError::UnknownServo(self.servo.clone()))?;

        if !(REQUEST_MIN_ANGLE..=REQUEST_MAX_ANGLE).contains(&self.value) {
            return Err(RequestError::OutOfRange(self.value));
        }
        let value = self.value as i32;

        Ok(match joint {
            JointId::Grip if value > 0 => ArmCommand::OpenGrip,
            JointId::Grip => ArmCommand::CloseGrip,
            other => ArmCommand::SetJoint(other, value),
        })
    }
}

/// Parse a raw request payload
pub fn parse_request(payload: Option<&[u8]>) -> Result<ArmCommand, RequestError> {
    let bytes = payload.ok_or(RequestError::Empty)?;
    let request: JointRequest = serde_json::from_slice(bytes)?;
    request.to_command()
}

// Reply to a local request:
// {"message": "ok", "state": {"pos": {...}}} or {"message": "error", "state": {"message": "..."}}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestReply {
    pub message: String,
    pub state: ReplyState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReplyState {
    Pos { pos: ArmSnapshot },
    Error { message: String },
}

impl RequestReply {
    pub fn ok(pos: ArmSnapshot) -> Self {
        Self {
            message: "ok".to_string(),
            state: ReplyState::Pos { pos },
        }
    }

    pub fn error(reason: impl ToString) -> Self {
        Self {
            message: "error".to_string(),
            state: ReplyState::Error {
                message: reason.to_string(),
            },
        }
    }
}

// Remote keys in the order they are applied
const REMOTE_KEYS: [(&str, RemoteKey); 7] = [
    ("moveelbow", RemoteKey::Move(JointId::Elbow)),
    ("elbow", RemoteKey::Set(JointId::Elbow)),
    ("moveshoulder", RemoteKey::Move(JointId::Shoulder)),
    ("shoulder", RemoteKey::Set(JointId::Shoulder)),
    ("movebase", RemoteKey::Move(JointId::Base)),
    ("base", RemoteKey::Set(JointId::Base)),
    ("grip", RemoteKey::Grip),
];

#[derive(Debug, Clone, Copy)]
enum RemoteKey {
    Move(JointId),
    Set(JointId),
    Grip,
}

/// Commands carried by a remote key/value payload, e.g.
/// `{"movebase": "-10", "grip": "Open"}`.
///
/// Unknown keys, non-string values and unparsable numbers are skipped.
pub fn parse_remote(payload: &Map<String, Value>) -> Vec<ArmCommand> {
    let mut commands = Vec::new();

    for (key, kind) in REMOTE_KEYS {
        let Some(value) = payload.get(key) else {
            continue;
        };
        let Some(text) = value.as_str() else {
            debug!("Ignoring non-string value for {}: {}", key, value);
            continue;
        };

        let command = match kind {
            RemoteKey::Grip => match text.to_lowercase().as_str() {
                "open" => Some(ArmCommand::OpenGrip),
                "close" => Some(ArmCommand::CloseGrip),
                _ => None,
            },
            RemoteKey::Move(joint) => text
                .trim()
                .parse()
                .ok()
                .map(|delta| ArmCommand::MoveJoint(joint, delta)),
            RemoteKey::Set(joint) => text
                .trim()
                .parse()
                .ok()
                .map(|angle| ArmCommand::SetJoint(joint, angle)),
        };

        match command {
            Some(command) => commands.push(command),
            None => debug!("Ignoring unparsable value for {}: {:?}", key, text),
        }
    }

    commands
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    BusFault,
}
