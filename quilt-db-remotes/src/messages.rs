//! Control-plane wire messages

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quilt_db_core::TreeClock;

use crate::error::{RemotesError, Result};

/// Retained hello announcing a clone on the registry topic
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRecord {
    pub id: String,
}

/// Retained presence record on the control topic
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: String,
    pub address: String,
}

/// A broadcast operation, stamped with its publisher for echo suppression
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub from: String,
    pub data: JsonValue,
}

/// A request sent to one peer's control address
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Ask an existing clone to fork its clock for us
    NewClock,
    /// Ask for a full snapshot
    Snapshot,
    /// Ask for the operations we missed since `time`
    Revup { time: TreeClock },
}

/// A response to a [`ControlRequest`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "kebab-case")]
pub enum ControlResponse {
    /// The forked clock half for the joiner
    NewClock { clock: TreeClock },
    /// Snapshot metadata plus the streamed channel addresses
    Snapshot {
        last_time: TreeClock,
        last_hash: String,
        data_address: String,
        updates_address: String,
    },
    /// Rev-up accepted; operations stream on this address
    RevupAccept { updates_address: String },
    /// The responder cannot rev-up the requester from the given time
    RevupReject,
    /// The responder failed to answer
    Error { message: String },
}

/// The reply envelope
///
/// `expect_ack = true` asks the requester to send an empty reply-to-reply
/// once it is ready to consume streamed data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub expect_ack: bool,
    /// Absent on a bare ack
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<ControlResponse>,
}

impl ReplyEnvelope {
    /// A reply carrying a response body
    pub fn body(body: ControlResponse, expect_ack: bool) -> Self {
        Self {
            expect_ack,
            body: Some(body),
        }
    }

    /// The empty acknowledgement
    pub fn ack() -> Self {
        Self {
            expect_ack: false,
            body: None,
        }
    }
}

/// One message on a streamed channel, in strict order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamMessage {
    Next { value: JsonValue },
    Complete,
    Error { message: String },
}

/// Decode a JSON payload
pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| RemotesError::bad_message(format!("undecodable payload: {}", e)))
}

/// Encode a JSON payload
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RemotesError::bad_message(e.to_string()))
}
