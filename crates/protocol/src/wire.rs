//! Frames exchanged between the relay and the remote agent.
//!
//! Every frame is one JSON object in a WebSocket text message, tagged by `type`.

use crate::{CommandPayload, ExecutionReport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

/// Relay to agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Execute(CommandEnvelope),
    Ping,
    Pong,
}

/// Agent to relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Result(ExecutionReport),
    Ping,
    Pong,
}

pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(text)
}

/// Best-effort extraction of the `id` of a frame that failed to decode, so the
/// agent can still answer it with a failed result.
pub fn frame_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
