//! Messages exchanged over the control channel.
//!
//! Every message is a `{ "id": <event>, "data": <payload> }` envelope written
//! as one line of JSON. Three conversations share that envelope:
//!
//! - an operator process and the host ([`IpcIncomingEvent`] / [`IpcOutgoingEvent`])
//! - the supervisor and a child bridge ([`ChildControl`] / [`ChildReport`])
//!
//! Requests and responses are paired by event name only. There is no
//! correlation id, so at most one request of a kind should be outstanding.

use bridgehost_core::{BridgeUsername, BridgedKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Environment variable that tells a process it has a parent on stdio.
pub const IPC_ENV_VAR: &str = "BRIDGEHOST_IPC";
pub const IPC_ENV_STDIO: &str = "stdio";

/// Raw envelope. Payload is opaque at this level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl IpcMessage {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Accept only objects with a non-empty string `id`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };
        let id = match object.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return None,
        };
        let data = object.remove("data").unwrap_or(Value::Null);
        Some(Self { id, data })
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok().and_then(Self::from_value)
    }

    pub fn from_event<E: Serialize>(event: &E) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(event)?;
        Self::from_value(value).ok_or_else(|| {
            serde::ser::Error::custom("event did not serialize to an {id, data} envelope")
        })
    }

    /// Interpret the envelope as a typed event; `None` for unknown ids or bad payloads.
    pub fn into_event<E: DeserializeOwned>(self) -> Option<E> {
        let mut object = Map::new();
        object.insert("id".into(), Value::String(self.id));
        if !self.data.is_null() {
            object.insert("data".into(), self.data);
        }
        serde_json::from_value(Value::Object(object)).ok()
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode one line of input into a typed event, dropping anything malformed.
pub fn decode_line<E: DeserializeOwned>(line: &str) -> Option<E> {
    IpcMessage::parse_line(line).and_then(IpcMessage::into_event)
}

/// Requests an operator process sends to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum IpcIncomingEvent {
    RestartChildBridge(String),
    StopChildBridge(String),
    StartChildBridge(String),
    ChildBridgeMetadataRequest,
}

/// Notifications the host sends to its operator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum IpcOutgoingEvent {
    ServerStatusUpdate(ServerStatusUpdate),
    ChildBridgeMetadataResponse(Vec<ChildBridgeMetadata>),
    ChildBridgeStatusUpdate(ChildBridgeMetadata),
}

/// Supervisor to child bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum ChildControl {
    MetadataRequest,
    Shutdown,
}

/// Child bridge to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum ChildReport {
    Ready(ChildReady),
    MetadataResponse(Map<String, Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChildReady {
    pub version: Option<String>,
    pub accessories: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Ok,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusUpdate {
    pub status: ServerStatus,
    pub name: String,
    pub username: BridgeUsername,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildBridgeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ChildBridgeStatus {
    /// `start` is accepted from these states.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl fmt::Display for ChildBridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// The supervisor's view of one child bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildBridgeMetadata {
    pub username: BridgeUsername,
    pub name: String,
    pub kind: BridgedKind,
    pub identifier: String,
    pub status: ChildBridgeStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub manually_stopped: bool,
    pub failure_reason: Option<String>,
    /// Last snapshot the child reported about itself.
    pub reported: Map<String, Value>,
}
