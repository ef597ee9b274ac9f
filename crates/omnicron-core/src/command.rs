//! Command records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::DomainError;
use crate::event::{DEFAULT_VERSION, Meta, complete_record};
use crate::stream::StreamId;

/// Opens a subscription on a connection.
pub const SUBSCRIBE: &str = "__Subscribe";

/// Closes a subscription on a connection.
pub const UNSUBSCRIBE: &str = "__Unsubscribe";

/// Returns a stream's raw history without committing anything.
pub const REPLAY: &str = "__replay";

/// Returns a stream's folded state as a single `__state` event.
pub const GET_STATE: &str = "__getState";

/// A request to change (or, for the reserved query types, to read) one
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Unique command id.
    pub id: Uuid,
    /// Creation time, millisecond resolution.
    pub ts: DateTime<Utc>,
    /// Schema version of the payload.
    pub v: u32,
    /// Command type, selects the command handler.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Target stream. Required for every command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Command-specific data.
    #[serde(default)]
    pub payload: Value,
    /// Connection metadata, merged in by the server.
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
    /// Credential presented with `__Subscribe`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Command {
    /// Creates a command for `stream_id` stamped with the system clock.
    #[must_use]
    pub fn new(command_type: impl Into<String>, stream_id: StreamId, payload: Value) -> Self {
        Self::new_at(command_type, stream_id, payload, &SystemClock)
    }

    /// Creates a command for `stream_id` stamped with `clock`.
    #[must_use]
    pub fn new_at(
        command_type: impl Into<String>,
        stream_id: StreamId,
        payload: Value,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: clock.timestamp(),
            v: DEFAULT_VERSION,
            command_type: command_type.into(),
            stream_id: Some(stream_id),
            payload,
            meta: Meta::default(),
            token: None,
        }
    }

    /// Builds a command from a field map, generating `id`, `ts` and `v` when
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `value` is not an object or its
    /// fields have the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        Self::from_value_at(value, &SystemClock)
    }

    /// Like [`Command::from_value`], stamping a missing `ts` from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `value` is not an object or its
    /// fields have the wrong shape.
    pub fn from_value_at(value: Value, clock: &dyn Clock) -> Result<Self, DomainError> {
        let fields = complete_record(value, clock)?;
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| DomainError::Validation(format!("malformed command: {e}")))
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Checks the two fields every command must carry and returns the
    /// target stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the id is nil or the stream is
    /// missing.
    pub fn validate(&self) -> Result<&StreamId, DomainError> {
        if self.id.is_nil() {
            return Err(DomainError::Validation(format!(
                "commands must have an id: {}",
                self.command_type
            )));
        }
        self.stream_id.as_ref().ok_or_else(|| {
            DomainError::Validation(format!(
                "commands must belong to a stream: {}",
                self.command_type
            ))
        })
    }

    /// Whether this is one of the read-only reserved types whose results go
    /// back to the requester only.
    #[must_use]
    pub fn is_query(&self) -> bool {
        self.command_type == REPLAY || self.command_type == GET_STATE
    }
}
