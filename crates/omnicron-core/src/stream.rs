//! Stream identifiers.
//!
//! A stream is addressed as `"<streamType>:<streamId>"`. An id segment of `*`
//! addresses every stream of that type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between the stream type and the instance id.
pub const SEPARATOR: char = ':';

/// Id segment that matches every stream of a type.
pub const WILDCARD: &str = "*";

/// Composite `"<type>:<id>"` stream key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Wraps an already composed key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Composes a key from a stream type and an instance id.
    #[must_use]
    pub fn compose(stream_type: &str, id: &str) -> Self {
        Self(format!("{stream_type}{SEPARATOR}{id}"))
    }

    /// The wildcard key covering all streams of `stream_type`.
    #[must_use]
    pub fn wildcard(stream_type: &str) -> Self {
        Self::compose(stream_type, WILDCARD)
    }

    /// The raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first separator, or the whole key when there is
    /// none.
    #[must_use]
    pub fn stream_type(&self) -> &str {
        self.0
            .split_once(SEPARATOR)
            .map_or(self.0.as_str(), |(stream_type, _)| stream_type)
    }

    /// Whether the last segment is the wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.rsplit(SEPARATOR).next() == Some(WILDCARD)
    }

    /// Treats `self` as a subscription filter: a wildcard matches every
    /// stream of the same type, anything else matches only itself.
    #[must_use]
    pub fn matches(&self, other: &StreamId) -> bool {
        if self.is_wildcard() {
            self.stream_type() == other.stream_type()
        } else {
            self == other
        }
    }

    /// Prefix shared by all keys of this stream's type, `"<type>:"`.
    #[must_use]
    pub fn type_prefix(&self) -> String {
        format!("{}{SEPARATOR}", self.stream_type())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for StreamId {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
