//! Journal abstraction.
//!
//! A journal is an ordered, per-stream, append-only log. Writers append at an
//! expected next sequence number and are rejected with a conflict when that
//! position is already taken.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::DomainError;
use crate::event::Event;
use crate::stream::StreamId;

/// Lowest sequence number of every stream.
pub const FLOOR: u64 = 1;

/// Lazy, ordered sequence of events read from a journal. A read failure
/// terminates the sequence with an error.
pub type EventStream<'a> = BoxStream<'a, Result<Event, DomainError>>;

/// Ordered seed data for [`Journal::reset`]: each stream's events are
/// committed contiguously from [`FLOOR`].
pub type Seed = Vec<(StreamId, Vec<Event>)>;

/// Lower bound of a [`Journal::find`] query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindFrom {
    /// Events whose `seq` is at least this value.
    Seq(u64),
    /// Events whose `ts` is at least this value. Only valid for wildcard
    /// queries.
    Timestamp(DateTime<Utc>),
}

impl Default for FindFrom {
    fn default() -> Self {
        Self::Seq(FLOOR)
    }
}

/// Storage contract shared by every journal backend.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Reads events lazily.
    ///
    /// - `None` scans every stream in insertion order.
    /// - A wildcard stream scans every stream of that type in insertion
    ///   order, or in timestamp order when `from` is a timestamp.
    /// - A concrete stream yields its events in ascending `seq`.
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_>;

    /// Stamps `seq = expected_seq + index` and the stream onto each event and
    /// writes them one at a time, each conditional on its position being free.
    ///
    /// Returns the committed events. The writes do not form a transaction: if
    /// a later write fails, earlier ones stay committed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Conflict` naming the first event whose position
    /// was taken, or `DomainError::Backend` on storage failure.
    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError>;

    /// Destroys and recreates the backing store, then commits `seed`.
    /// Testing and bootstrap only.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` when resetting is disabled for
    /// this environment, or `DomainError::Backend` on storage failure.
    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError>;
}

/// Rejects a timestamp lower bound on a concrete stream.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a timestamp query that is not a
/// wildcard query.
pub fn check_find(stream: Option<&StreamId>, from: FindFrom) -> Result<(), DomainError> {
    match (stream, from) {
        (Some(stream), FindFrom::Timestamp(_)) if !stream.is_wildcard() => {
            Err(DomainError::Validation(format!(
                "timestamp queries are only valid for wildcard streams, got {stream}"
            )))
        }
        (None, FindFrom::Timestamp(_)) => Err(DomainError::Validation(
            "timestamp queries are only valid for wildcard streams".to_owned(),
        )),
        _ => Ok(()),
    }
}

/// Returns an event stream that yields `err` and ends.
#[must_use]
pub fn failed<'a>(err: DomainError) -> EventStream<'a> {
    stream::once(async move { Err(err) }).boxed()
}

/// Stamps the stream and contiguous sequence numbers onto `events`.
#[must_use]
pub fn sequence(stream: &StreamId, expected_seq: u64, events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .zip(expected_seq..)
        .map(|(mut event, seq)| {
            event.stream_id = stream.clone();
            event.seq = seq;
            event
        })
        .collect()
}

/// Builds the conflict error for an event whose position was taken.
#[must_use]
pub fn conflict(event: &Event) -> DomainError {
    DomainError::Conflict {
        event_type: event.event_type.clone(),
        stream: event.stream_id.to_string(),
        expected: event.seq,
    }
}

/// Commits every seeded stream from [`FLOOR`], in seed order.
///
/// # Errors
///
/// Propagates the first commit failure.
pub async fn apply_seed(journal: &dyn Journal, seed: Seed) -> Result<(), DomainError> {
    for (stream, events) in seed {
        journal.commit(&stream, FLOOR, events).await?;
    }
    Ok(())
}
