//! Event records.
//!
//! An event is an immutable fact. It is created by a command handler, stamped
//! with its stream and `seq` by the journal at commit time, and never changed
//! afterwards. Consumers receive committed events behind an `Arc`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::DomainError;
use crate::stream::StreamId;

/// Schema version stamped on records that do not carry one.
pub const DEFAULT_VERSION: u32 = 1;

/// Synthetic event carrying a computed snapshot under `payload.state`.
pub const STATE: &str = "__state";

/// Protocol error: the subscription was refused. Terminal for that
/// subscription.
pub const UNAUTHORIZED_ERROR: &str = "__UnauthorizedError";

/// Protocol error: a command was rejected. Sent only to the requester.
pub const ERROR: &str = "__Error";

/// Connection metadata attached to commands, and inherited by the events
/// they produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Id of the connection that issued the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Uuid>,
    /// Remote address of that connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// User agent of that connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Caller-supplied fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Returns `true` when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.client.is_none() && self.ip.is_none() && self.agent.is_none() && self.extra.is_empty()
    }
}

/// A domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event id.
    pub id: Uuid,
    /// Creation time, millisecond resolution.
    pub ts: DateTime<Utc>,
    /// Schema version of the payload.
    pub v: u32,
    /// Event type, selects the event handler.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Stream the event belongs to. Set by the journal at commit time.
    #[serde(default)]
    pub stream_id: StreamId,
    /// Event-specific data.
    #[serde(default)]
    pub payload: Value,
    /// 1-based position within the stream, `0` until committed.
    #[serde(default)]
    pub seq: u64,
    /// Metadata of the command that caused this event.
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

impl Event {
    /// Creates an uncommitted event stamped with the system clock.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self::new_at(event_type, payload, &SystemClock)
    }

    /// Creates an uncommitted event stamped with `clock`.
    #[must_use]
    pub fn new_at(event_type: impl Into<String>, payload: Value, clock: &dyn Clock) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: clock.timestamp(),
            v: DEFAULT_VERSION,
            event_type: event_type.into(),
            stream_id: StreamId::default(),
            payload,
            seq: 0,
            meta: Meta::default(),
        }
    }

    /// Builds an event from a field map, generating `id`, `ts` and `v` when
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `value` is not an object or its
    /// fields have the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        Self::from_value_at(value, &SystemClock)
    }

    /// Like [`Event::from_value`], stamping a missing `ts` from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `value` is not an object or its
    /// fields have the wrong shape.
    pub fn from_value_at(value: Value, clock: &dyn Clock) -> Result<Self, DomainError> {
        let fields = complete_record(value, clock)?;
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| DomainError::Validation(format!("malformed event: {e}")))
    }

    /// Sets the stream.
    #[must_use]
    pub fn with_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Whether the journal has assigned a sequence number.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.seq > 0
    }
}

/// Fills `id`, `ts` and `v` into a record's field map when they are absent
/// or null.
pub(crate) fn complete_record(
    value: Value,
    clock: &dyn Clock,
) -> Result<Map<String, Value>, DomainError> {
    let Value::Object(mut fields) = value else {
        return Err(DomainError::Validation(
            "records must be built from an object".to_owned(),
        ));
    };

    if fields.get("id").is_none_or(Value::is_null) {
        fields.insert("id".to_owned(), Value::String(Uuid::new_v4().to_string()));
    }
    if fields.get("ts").is_none_or(Value::is_null) {
        let ts = clock.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true);
        fields.insert("ts".to_owned(), Value::String(ts));
    }
    if fields.get("v").is_none_or(Value::is_null) {
        fields.insert("v".to_owned(), Value::from(DEFAULT_VERSION));
    }

    Ok(fields)
}
