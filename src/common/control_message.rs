//! reliable channel protocol between clients and the room server
//!
//! Newline delimited JSON with a string `type` discriminator.  Parsing is
//! deliberately tolerant: unknown fields are ignored so clients can ship
//! extra data without breaking older servers, and a missing required field
//! just fails that one message.  Callers log and drop parse failures, the
//! session is never torn down over a bad message.
use serde_json::{json, Value};
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

/// One entry in a room_state snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantEntry {
    pub id: String,
    pub name: String,
}

/// The messages that ride the reliable channel, both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// client -> server: attach this session to a participant slot
    Bind { participant_id: String, room: String },
    /// client -> server latency probe, echoed back as Pong
    Ping { id: u64, t: f64 },
    /// answer to a ping (either direction)
    Pong { id: u64, t: f64 },
    /// client -> server: how loud `participant_id` is in my mix
    Gain { participant_id: String, value: f32 },
    /// client -> server: mute `participant_id` in my mix
    Mute { participant_id: String, muted: bool },
    /// server -> client: everybody currently in the room
    RoomState { participants: Vec<ParticipantEntry> },
    ParticipantJoined { id: String, name: String },
    ParticipantLeft { id: String },
    /// server -> client: somebody outside wants the room
    VacateRequest,
    Error { error: String },
}

impl ControlMessage {
    pub fn from_string(data: &str) -> Result<ControlMessage, BoxError> {
        let raw: Value = serde_json::from_str(data)?;
        Self::from_json(&raw)
    }

    /// Decode a message from parsed JSON.  Extra fields are fine, missing
    /// required fields are not.
    pub fn from_json(raw: &Value) -> Result<ControlMessage, BoxError> {
        let mtype = match raw["type"].as_str() {
            Some(t) => t,
            None => bail!("message has no type"),
        };
        match mtype {
            "bind" => Ok(ControlMessage::Bind {
                participant_id: required_str(raw, "participant_id")?,
                room: required_str(raw, "room")?,
            }),
            "ping" => Ok(ControlMessage::Ping {
                id: match raw["id"].as_u64() {
                    Some(i) => i,
                    None => bail!("ping has no id"),
                },
                t: raw["t"].as_f64().unwrap_or(0.0),
            }),
            "pong" => Ok(ControlMessage::Pong {
                id: match raw["id"].as_u64() {
                    Some(i) => i,
                    None => bail!("pong has no id"),
                },
                t: raw["t"].as_f64().unwrap_or(0.0),
            }),
            "gain" => Ok(ControlMessage::Gain {
                participant_id: required_str(raw, "participant_id")?,
                value: match raw["value"].as_f64() {
                    Some(v) => v as f32,
                    None => bail!("gain has no value"),
                },
            }),
            "mute" => Ok(ControlMessage::Mute {
                participant_id: required_str(raw, "participant_id")?,
                muted: match raw["muted"].as_bool() {
                    Some(b) => b,
                    None => bail!("mute has no muted flag"),
                },
            }),
            other => bail!("unknown message type: {}", other),
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            ControlMessage::Bind {
                participant_id,
                room,
            } => json!({"type": "bind", "participant_id": participant_id, "room": room}),
            ControlMessage::Ping { id, t } => json!({"type": "ping", "id": id, "t": t}),
            ControlMessage::Pong { id, t } => json!({"type": "pong", "id": id, "t": t}),
            ControlMessage::Gain {
                participant_id,
                value,
            } => json!({"type": "gain", "participant_id": participant_id, "value": value}),
            ControlMessage::Mute {
                participant_id,
                muted,
            } => json!({"type": "mute", "participant_id": participant_id, "muted": muted}),
            ControlMessage::RoomState { participants } => {
                let list: Vec<Value> = participants
                    .iter()
                    .map(|p| json!({"id": p.id, "name": p.name}))
                    .collect();
                json!({"type": "room_state", "participants": list})
            }
            ControlMessage::ParticipantJoined { id, name } => {
                json!({"type": "participant_joined", "id": id, "name": name})
            }
            ControlMessage::ParticipantLeft { id } => {
                json!({"type": "participant_left", "id": id})
            }
            ControlMessage::VacateRequest => json!({"type": "vacate_request"}),
            ControlMessage::Error { error } => json!({"type": "error", "error": error}),
        }
    }

}

fn required_str(raw: &Value, key: &str) -> Result<String, BoxError> {
    match raw[key].as_str() {
        Some(s) if !s.is_empty() => Ok(String::from(s)),
        _ => bail!("message missing field: {}", key),
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}
