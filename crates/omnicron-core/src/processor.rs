//! Event processing: applying events to state and replaying streams.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::DomainError;
use crate::event::Event;
use crate::journal::{FLOOR, FindFrom, Journal};
use crate::stream::StreamId;

/// Folds one event into state.
pub type EventHandler<S> = Box<dyn Fn(&S, &Event) -> S + Send + Sync>;

/// Capability of folding events into state.
pub trait Apply<S> {
    /// Applies `event` to `state`. Unknown event types leave the state
    /// unchanged.
    fn apply(&self, state: S, event: &Event) -> S;
}

/// Events already read from the journal for one stream key.
#[derive(Debug, Default)]
struct CachedStream {
    events: Vec<Event>,
    max_ts: Option<DateTime<Utc>>,
}

impl CachedStream {
    fn push(&mut self, event: Event) {
        self.max_ts = self.max_ts.max(Some(event.ts));
        self.events.push(event);
    }
}

/// Per-stream event cache, scoped to one processor.
///
/// Each key has its own lock, so replays of one stream are serialized while
/// different streams proceed independently.
#[derive(Debug, Default)]
struct EventCache {
    entries: Mutex<HashMap<StreamId, Arc<Mutex<CachedStream>>>>,
}

impl EventCache {
    async fn entry(&self, stream: &StreamId) -> Arc<Mutex<CachedStream>> {
        self.entries
            .lock()
            .await
            .entry(stream.clone())
            .or_default()
            .clone()
    }

    async fn existing(&self, stream: &StreamId) -> Option<Arc<Mutex<CachedStream>>> {
        self.entries.lock().await.get(stream).cloned()
    }

    async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// Restores state by folding a stream's events through per-type handlers.
pub struct EventProcessor<S> {
    handlers: HashMap<String, EventHandler<S>>,
    cache: EventCache,
}

impl<S> Default for EventProcessor<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            cache: EventCache::default(),
        }
    }
}

impl<S> std::fmt::Debug for EventProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S> Apply<S> for EventProcessor<S> {
    fn apply(&self, state: S, event: &Event) -> S {
        match self.handlers.get(&event.event_type) {
            Some(handler) => handler(&state, event),
            None => {
                warn!(
                    event_type = %event.event_type,
                    stream = %event.stream_id,
                    seq = event.seq,
                    "no event handler registered, skipping event"
                );
                state
            }
        }
    }
}

impl<S: Send + Sync> EventProcessor<S> {
    /// Creates a processor with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `event_type`, replacing any previous one.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl Fn(&S, &Event) -> S + Send + Sync + 'static,
    ) {
        self.handlers.insert(event_type.into(), Box::new(handler));
    }

    /// Whether a handler is registered for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Folds the events of `stream` from `from_seq` onto `initial_state`.
    ///
    /// Returns the state and the `seq` of the last event, `None` if there
    /// were none.
    ///
    /// # Errors
    ///
    /// Returns the journal's error if the read fails. Events already cached
    /// by the failed read are kept.
    pub async fn replay(
        &self,
        journal: &dyn Journal,
        stream: &StreamId,
        from_seq: u64,
        initial_state: S,
    ) -> Result<(S, Option<u64>), DomainError> {
        debug!(%stream, from_seq, "replay");
        self.traverse(journal, stream, from_seq, initial_state, |state, event| {
            self.apply(state, event)
        })
        .await
    }

    /// Same traversal as [`EventProcessor::replay`], returning the raw
    /// events instead of folded state.
    ///
    /// # Errors
    ///
    /// Returns the journal's error if the read fails.
    pub async fn replay_events(
        &self,
        journal: &dyn Journal,
        stream: &StreamId,
        from_seq: u64,
    ) -> Result<(Vec<Event>, Option<u64>), DomainError> {
        debug!(%stream, from_seq, "replay events");
        self.traverse(journal, stream, from_seq, Vec::new(), |mut events, event| {
            events.push(event.clone());
            events
        })
        .await
    }

    /// Appends freshly committed events to a concrete stream's cache when
    /// they continue it exactly. Anything else is left for the next replay
    /// to pick up from the journal.
    pub async fn remember(&self, stream: &StreamId, committed: &[Event]) {
        let Some(first) = committed.first() else {
            return;
        };
        let Some(entry) = self.cache.existing(stream).await else {
            return;
        };
        let mut cached = entry.lock().await;
        let next = cached.events.last().map_or(FLOOR, |e| e.seq + 1);
        if first.seq == next {
            for event in committed {
                cached.push(event.clone());
            }
        }
    }

    /// Drops every cached stream.
    pub async fn reset_cache(&self) {
        self.cache.clear().await;
    }

    async fn traverse<T: Send>(
        &self,
        journal: &dyn Journal,
        stream: &StreamId,
        from_seq: u64,
        init: T,
        fold: impl Fn(T, &Event) -> T + Send,
    ) -> Result<(T, Option<u64>), DomainError> {
        // Partial reads are not cached, so a cache is always a prefix of the
        // stream (or, for wildcards, of the full scan).
        if from_seq > FLOOR {
            return fold_uncached(journal, stream, from_seq, init, fold).await;
        }

        let entry = self.cache.entry(stream).await;
        let mut cached = entry.lock().await;

        if stream.is_wildcard() {
            refresh_wildcard(journal, stream, &mut cached).await?;
        } else {
            refresh_concrete(journal, stream, &mut cached).await?;
        }

        let last = cached.events.last().map(|e| e.seq);
        let acc = cached.events.iter().fold(init, fold);
        Ok((acc, last))
    }
}

async fn fold_uncached<T>(
    journal: &dyn Journal,
    stream: &StreamId,
    from_seq: u64,
    init: T,
    fold: impl Fn(T, &Event) -> T,
) -> Result<(T, Option<u64>), DomainError> {
    let mut events = journal.find(Some(stream), FindFrom::Seq(from_seq));
    let mut acc = init;
    let mut last = None;
    while let Some(event) = events.next().await {
        let event = event?;
        last = Some(event.seq);
        acc = fold(acc, &event);
    }
    Ok((acc, last))
}

async fn refresh_concrete(
    journal: &dyn Journal,
    stream: &StreamId,
    cached: &mut CachedStream,
) -> Result<(), DomainError> {
    let next = cached.events.last().map_or(FLOOR, |e| e.seq + 1);
    let mut fresh = journal.find(Some(stream), FindFrom::Seq(next));
    while let Some(event) = fresh.next().await {
        cached.push(event?);
    }
    Ok(())
}

async fn refresh_wildcard(
    journal: &dyn Journal,
    stream: &StreamId,
    cached: &mut CachedStream,
) -> Result<(), DomainError> {
    // Events sharing the last seen millisecond but committed after the
    // previous scan are not picked up.
    let from = match cached.max_ts {
        Some(ts) if !cached.events.is_empty() => FindFrom::Timestamp(ts + Duration::milliseconds(1)),
        _ => FindFrom::Seq(FLOOR),
    };

    let mut fresh = journal.find(Some(stream), from);
    while let Some(event) = fresh.next().await {
        cached.push(event?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{self, EventStream};
    use crate::mem_journal::MemJournal;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Ticks(u64);

    fn ticker() -> EventProcessor<Ticks> {
        let mut processor = EventProcessor::new();
        processor.register("Ticked", |state: &Ticks, _: &Event| Ticks(state.0 + 1));
        processor
    }

    fn ticked() -> Event {
        Event::new("Ticked", Value::Null)
    }

    #[test]
    fn test_apply_calls_each_events_handler() {
        let mut processor = EventProcessor::new();
        processor.register("Pinged", |_: &Value, _: &Event| json!({"status": "pinged"}));
        processor.register("Ponged", |_: &Value, _: &Event| json!({"status": "ponged"}));

        let state = processor.apply(json!({}), &Event::new("Pinged", Value::Null));
        assert_eq!(state, json!({"status": "pinged"}));

        let state = processor.apply(state, &Event::new("Ponged", Value::Null));
        assert_eq!(state, json!({"status": "ponged"}));
    }

    #[test]
    fn test_apply_skips_unknown_event_types() {
        let processor = ticker();

        let state = processor.apply(Ticks(7), &Event::new("FromTheFuture", Value::Null));

        assert_eq!(state, Ticks(7));
    }

    #[tokio::test]
    async fn test_replay_restores_state_from_journal() {
        // Arrange
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        journal
            .reset(Some(vec![(stream.clone(), (0..10).map(|_| ticked()).collect())]))
            .await
            .unwrap();
        let processor = ticker();

        // Act
        let (state, seq) = processor.replay(&journal, &stream, 0, Ticks(0)).await.unwrap();

        // Assert
        assert_eq!(state, Ticks(10));
        assert_eq!(seq, Some(10));
    }

    #[tokio::test]
    async fn test_replay_of_empty_stream_returns_initial_state_and_no_sequence() {
        let journal = MemJournal::new();

        let (state, seq) = ticker()
            .replay(&journal, &"ticker:1".into(), 1, Ticks(0))
            .await
            .unwrap();

        assert_eq!(state, Ticks(0));
        assert_eq!(seq, None);
    }

    #[tokio::test]
    async fn test_replay_matches_manual_fold() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ledger:1");
        let events: Vec<Event> = [3, -1, 10, 4]
            .iter()
            .map(|n| Event::new("Moved", json!({"by": n})))
            .collect();
        let committed = journal.commit(&stream, 1, events).await.unwrap();

        let mut processor = EventProcessor::new();
        processor.register("Moved", |state: &i64, e: &Event| {
            state * 2 + e.payload["by"].as_i64().unwrap_or_default()
        });

        let (replayed, _) = processor.replay(&journal, &stream, 1, 5).await.unwrap();
        let manual = committed.iter().fold(5, |s, e| processor.apply(s, e));

        assert_eq!(replayed, manual);
    }

    #[tokio::test]
    async fn test_replay_picks_up_events_committed_after_caching() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        let processor = ticker();
        journal.commit(&stream, 1, vec![ticked(), ticked()]).await.unwrap();
        processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();

        journal.commit(&stream, 3, vec![ticked()]).await.unwrap();
        let (state, seq) = processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();

        assert_eq!(state, Ticks(3));
        assert_eq!(seq, Some(3));
    }

    #[tokio::test]
    async fn test_replay_from_later_sequence_folds_only_the_tail() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        journal.commit(&stream, 1, vec![ticked(), ticked(), ticked()]).await.unwrap();

        let (state, seq) = ticker().replay(&journal, &stream, 3, Ticks(0)).await.unwrap();

        assert_eq!(state, Ticks(1));
        assert_eq!(seq, Some(3));
    }

    #[tokio::test]
    async fn test_replay_events_returns_history_in_commit_order() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        let committed = journal
            .commit(&stream, 1, vec![ticked(), ticked(), ticked()])
            .await
            .unwrap();

        let (events, seq) = ticker().replay_events(&journal, &stream, 1).await.unwrap();

        assert_eq!(events, committed);
        assert_eq!(seq, Some(3));
    }

    #[tokio::test]
    async fn test_wildcard_replay_refreshes_from_latest_timestamp() {
        // Arrange
        let journal = MemJournal::new();
        let processor = ticker();
        let wildcard = StreamId::wildcard("ticker");
        let mut first = ticked();
        first.ts -= Duration::seconds(5);
        journal.commit(&"ticker:1".into(), 1, vec![first]).await.unwrap();
        journal.commit(&"email:1".into(), 1, vec![ticked()]).await.unwrap();
        let (state, _) = processor.replay(&journal, &wildcard, 1, Ticks(0)).await.unwrap();
        assert_eq!(state, Ticks(1));

        // Act
        journal.commit(&"ticker:2".into(), 1, vec![ticked()]).await.unwrap();
        let (state, _) = processor.replay(&journal, &wildcard, 1, Ticks(0)).await.unwrap();

        // Assert
        assert_eq!(state, Ticks(2));
        let (events, _) = processor.replay_events(&journal, &wildcard, 1).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_remember_extends_cache_only_when_contiguous() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        let processor = ticker();
        journal.commit(&stream, 1, vec![ticked()]).await.unwrap();
        processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();

        let committed = journal.commit(&stream, 2, vec![ticked()]).await.unwrap();
        processor.remember(&stream, &committed).await;
        processor.remember(&stream, &committed).await;

        let (events, seq) = processor.replay_events(&journal, &stream, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(seq, Some(2));
    }

    #[tokio::test]
    async fn test_reset_cache_forces_full_reload() {
        let journal = MemJournal::new();
        let stream = StreamId::from("ticker:1");
        let processor = ticker();
        journal.commit(&stream, 1, vec![ticked(), ticked()]).await.unwrap();
        processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();

        journal.reset(Some(vec![(stream.clone(), vec![ticked()])])).await.unwrap();
        processor.reset_cache().await;

        let (state, seq) = processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();
        assert_eq!(state, Ticks(1));
        assert_eq!(seq, Some(1));
    }

    /// Journal whose reads break off with an error after `limit` events
    /// while `broken` is set.
    struct Interrupted {
        inner: MemJournal,
        broken: AtomicBool,
        limit: usize,
    }

    #[async_trait::async_trait]
    impl Journal for Interrupted {
        fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
            let events = self.inner.find(stream, from);
            if self.broken.load(Ordering::SeqCst) {
                events
                    .take(self.limit)
                    .chain(journal::failed(DomainError::Backend("connection reset".into())))
                    .boxed()
            } else {
                events
            }
        }

        async fn commit(
            &self,
            stream: &StreamId,
            expected_seq: u64,
            events: Vec<Event>,
        ) -> Result<Vec<Event>, DomainError> {
            self.inner.commit(stream, expected_seq, events).await
        }

        async fn reset(&self, seed: Option<journal::Seed>) -> Result<(), DomainError> {
            self.inner.reset(seed).await
        }
    }

    #[tokio::test]
    async fn test_failed_read_fails_replay_but_keeps_cached_prefix() {
        // Arrange
        let journal = Interrupted {
            inner: MemJournal::new(),
            broken: AtomicBool::new(true),
            limit: 2,
        };
        let stream = StreamId::from("ticker:1");
        journal.commit(&stream, 1, vec![ticked(), ticked(), ticked()]).await.unwrap();
        let processor = ticker();

        // Act
        let failed = processor.replay(&journal, &stream, 1, Ticks(0)).await;
        journal.broken.store(false, Ordering::SeqCst);
        let (state, seq) = processor.replay(&journal, &stream, 1, Ticks(0)).await.unwrap();

        // Assert
        assert!(matches!(failed, Err(DomainError::Backend(_))));
        assert_eq!(state, Ticks(3));
        assert_eq!(seq, Some(3));
        let (events, _) = processor.replay_events(&journal, &stream, 1).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
