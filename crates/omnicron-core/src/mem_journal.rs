//! In-memory reference implementation of the `Journal` trait.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::error::DomainError;
use crate::event::Event;
use crate::journal::{self, EventStream, FLOOR, FindFrom, Journal, Seed};
use crate::stream::StreamId;

#[derive(Debug, Default)]
struct Entries {
    /// Events per stream, index `i` holds `seq == FLOOR + i`.
    streams: HashMap<StreamId, Vec<Event>>,
    /// Global insertion order as `(stream, index)` pairs.
    order: Vec<(StreamId, usize)>,
}

/// Journal held in process memory. Appends are checked and applied under one
/// write lock, so a commit is never observed half-applied.
#[derive(Debug)]
pub struct MemJournal {
    entries: RwLock<Entries>,
    allow_reset: bool,
}

impl Default for MemJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemJournal {
    /// Creates an empty journal whose `reset` is enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            allow_reset: true,
        }
    }

    /// Creates an empty journal whose `reset` is disabled.
    #[must_use]
    pub fn production() -> Self {
        Self {
            allow_reset: false,
            ..Self::new()
        }
    }

    /// Number of events committed to `stream`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Backend` if the journal lock is poisoned.
    pub fn len(&self, stream: &StreamId) -> Result<usize, DomainError> {
        Ok(self.read()?.streams.get(stream).map_or(0, Vec::len))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>, DomainError> {
        self.entries
            .read()
            .map_err(|_| DomainError::Backend("journal lock poisoned".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>, DomainError> {
        self.entries
            .write()
            .map_err(|_| DomainError::Backend("journal lock poisoned".to_owned()))
    }

    fn snapshot(&self, stream: Option<&StreamId>, from: FindFrom) -> Result<Vec<Event>, DomainError> {
        journal::check_find(stream, from)?;
        let entries = self.read()?;

        let selected = match stream {
            Some(stream) if !stream.is_wildcard() => entries
                .streams
                .get(stream)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| passes(e, from))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            _ => {
                let mut scanned: Vec<Event> = entries
                    .order
                    .iter()
                    .filter(|(key, _)| stream.is_none_or(|filter| filter.matches(key)))
                    .filter_map(|(key, index)| entries.streams.get(key)?.get(*index))
                    .filter(|e| passes(e, from))
                    .cloned()
                    .collect();
                if matches!(from, FindFrom::Timestamp(_)) {
                    // Stable, so ties keep insertion order.
                    scanned.sort_by_key(|e| e.ts);
                }
                scanned
            }
        };

        Ok(selected)
    }
}

fn passes(event: &Event, from: FindFrom) -> bool {
    match from {
        FindFrom::Seq(seq) => event.seq >= seq,
        FindFrom::Timestamp(ts) => event.ts >= ts,
    }
}

#[async_trait]
impl Journal for MemJournal {
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
        debug!(stream = ?stream.map(StreamId::as_str), ?from, "find");
        match self.snapshot(stream, from) {
            Ok(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Err(err) => journal::failed(err),
        }
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        if stream.is_wildcard() {
            return Err(DomainError::Validation(format!(
                "cannot commit to wildcard stream {stream}"
            )));
        }

        let events = journal::sequence(stream, expected_seq, events);
        let mut entries = self.write()?;
        let Entries { streams, order } = &mut *entries;
        let log = streams.entry(stream.clone()).or_default();

        for event in &events {
            let next = FLOOR + log.len() as u64;
            if event.seq != next {
                let err = journal::conflict(event);
                debug!(%stream, found = next, "{err}");
                return Err(err);
            }
            order.push((stream.clone(), log.len()));
            log.push(event.clone());
        }

        debug!(%stream, expected_seq, count = events.len(), "commit");
        Ok(events)
    }

    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError> {
        if !self.allow_reset {
            return Err(DomainError::Configuration(
                "journal reset is disabled in production".to_owned(),
            ));
        }

        *self.write()? = Entries::default();

        match seed {
            Some(seed) => journal::apply_seed(self, seed).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::Value;

    fn event() -> Event {
        Event::new("TestEvent", Value::Null)
    }

    async fn collect(journal: &MemJournal, stream: Option<&StreamId>, from: FindFrom) -> Vec<Event> {
        journal.find(stream, from).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_errors_when_referencing_a_stale_sequence() {
        // Arrange
        let journal = MemJournal::new();
        let stream = StreamId::from("TestAggregate");
        journal.commit(&stream, 1, vec![event()]).await.unwrap();

        // Act
        let err = journal.commit(&stream, 1, vec![event()]).await.unwrap_err();

        // Assert
        assert_eq!(
            err.to_string(),
            "Conflicting sequence number for TestEvent: TestAggregate, expected 1"
        );
        assert_eq!(journal.len(&stream).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_succeeds_for_succeeding_sequences() {
        let journal = MemJournal::new();
        let stream = StreamId::from("TestAggregate");

        journal.commit(&stream, 1, vec![event()]).await.unwrap();
        let committed = journal.commit(&stream, 2, vec![event()]).await.unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].seq, 2);
        assert_eq!(committed[0].stream_id, stream);
    }

    #[tokio::test]
    async fn test_commit_accepts_several_events_per_call() {
        let journal = MemJournal::new();
        let stream = StreamId::from("TestAggregate");

        journal.commit(&stream, 1, vec![event(), event(), event()]).await.unwrap();
        journal.commit(&stream, 4, vec![event()]).await.unwrap();
        journal.commit(&stream, 5, vec![event(), event()]).await.unwrap();

        let seqs: Vec<u64> = collect(&journal, Some(&stream), FindFrom::default())
            .await
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_commit_rejects_gaps() {
        let journal = MemJournal::new();
        let stream = StreamId::from("TestAggregate");

        let err = journal.commit(&stream, 3, vec![event()]).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(journal.len(&stream).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_rejects_wildcard_stream() {
        let journal = MemJournal::new();

        let result = journal.commit(&"ticker:*".into(), 1, vec![event()]).await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_find_streams_back_events_from_sequence() {
        let journal = MemJournal::new();
        let stream = StreamId::from("TestAggregate");
        journal.commit(&stream, 1, vec![event(), event(), event()]).await.unwrap();

        assert_eq!(collect(&journal, Some(&stream), FindFrom::Seq(0)).await.len(), 3);
        assert_eq!(collect(&journal, Some(&stream), FindFrom::Seq(2)).await.len(), 2);
        assert!(collect(&journal, Some(&"other:1".into()), FindFrom::Seq(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_find_without_stream_scans_everything_in_insertion_order() {
        let journal = MemJournal::new();
        journal.commit(&"client-profile:1".into(), 1, vec![event(), event(), event()]).await.unwrap();
        journal.commit(&"email:1".into(), 1, vec![event()]).await.unwrap();
        journal.commit(&"client-profile:1".into(), 4, vec![event()]).await.unwrap();

        let all = collect(&journal, None, FindFrom::default()).await;

        let keys: Vec<(&str, u64)> = all.iter().map(|e| (e.stream_id.as_str(), e.seq)).collect();
        assert_eq!(
            keys,
            vec![
                ("client-profile:1", 1),
                ("client-profile:1", 2),
                ("client-profile:1", 3),
                ("email:1", 1),
                ("client-profile:1", 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_find_wildcard_filters_by_stream_type() {
        let journal = MemJournal::new();
        journal.commit(&"client-profile:1".into(), 1, vec![event(), event(), event()]).await.unwrap();
        journal.commit(&"client-profile:2".into(), 1, vec![event()]).await.unwrap();
        journal.commit(&"email:1".into(), 1, vec![event()]).await.unwrap();

        let found = collect(&journal, Some(&"client-profile:*".into()), FindFrom::default()).await;

        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|e| e.stream_id.stream_type() == "client-profile"));
    }

    #[tokio::test]
    async fn test_find_wildcard_from_timestamp() {
        let journal = MemJournal::new();
        let mut old = event();
        old.ts -= chrono::Duration::seconds(10);
        let cutoff = old.ts + chrono::Duration::seconds(5);
        journal.commit(&"ticker:1".into(), 1, vec![old]).await.unwrap();
        journal.commit(&"ticker:2".into(), 1, vec![event()]).await.unwrap();

        let found = collect(&journal, Some(&"ticker:*".into()), FindFrom::Timestamp(cutoff)).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].stream_id.as_str(), "ticker:2");
    }

    #[tokio::test]
    async fn test_find_timestamp_on_concrete_stream_yields_error() {
        let journal = MemJournal::new();

        let result: Result<Vec<Event>, DomainError> = journal
            .find(Some(&"ticker:1".into()), FindFrom::Timestamp(chrono::Utc::now()))
            .try_collect()
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reset_clears_and_seeds_each_stream_from_floor() {
        let journal = MemJournal::new();
        journal.commit(&"old:1".into(), 1, vec![event()]).await.unwrap();

        journal
            .reset(Some(vec![
                ("ticker:1".into(), vec![event(), event()]),
                ("ticker:2".into(), vec![event()]),
            ]))
            .await
            .unwrap();

        assert_eq!(journal.len(&"old:1".into()).unwrap(), 0);
        assert_eq!(journal.len(&"ticker:1".into()).unwrap(), 2);
        let seeded = collect(&journal, Some(&"ticker:2".into()), FindFrom::default()).await;
        assert_eq!(seeded[0].seq, FLOOR);
    }

    #[tokio::test]
    async fn test_reset_is_disabled_in_production() {
        let journal = MemJournal::production();
        journal.commit(&"ticker:1".into(), 1, vec![event()]).await.unwrap();

        let result = journal.reset(None).await;

        assert!(matches!(result, Err(DomainError::Configuration(_))));
        assert_eq!(journal.len(&"ticker:1".into()).unwrap(), 1);
    }
}
