//! Test journals — `Journal` implementations that record or fail on demand.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use omnicron_core::error::DomainError;
use omnicron_core::event::Event;
use omnicron_core::journal::{self, EventStream, FindFrom, Journal, Seed};
use omnicron_core::mem_journal::MemJournal;
use omnicron_core::stream::StreamId;

/// A journal backed by [`MemJournal`] that records every `find` and
/// `commit` call.
#[derive(Debug, Default)]
pub struct RecordingJournal {
    inner: MemJournal,
    finds: Mutex<Vec<(Option<StreamId>, FindFrom)>>,
    commits: Mutex<Vec<(StreamId, u64, usize)>>,
}

impl RecordingJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `find` call as `(stream, from)`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn finds(&self) -> Vec<(Option<StreamId>, FindFrom)> {
        self.finds.lock().unwrap().clone()
    }

    /// Every `commit` call as `(stream, expected_seq, event count)`,
    /// including rejected ones.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn commits(&self) -> Vec<(StreamId, u64, usize)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Journal for RecordingJournal {
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
        self.finds.lock().unwrap().push((stream.cloned(), from));
        self.inner.find(stream, from)
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        self.commits
            .lock()
            .unwrap()
            .push((stream.clone(), expected_seq, events.len()));
        self.inner.commit(stream, expected_seq, events).await
    }

    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError> {
        self.inner.reset(seed).await
    }
}

/// A journal whose every operation fails with `DomainError::Backend`.
#[derive(Debug)]
pub struct FailingJournal {
    message: String,
}

impl FailingJournal {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn error(&self) -> DomainError {
        DomainError::Backend(self.message.clone())
    }
}

#[async_trait]
impl Journal for FailingJournal {
    fn find(&self, _stream: Option<&StreamId>, _from: FindFrom) -> EventStream<'_> {
        journal::failed(self.error())
    }

    async fn commit(
        &self,
        _stream: &StreamId,
        _expected_seq: u64,
        _events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        Err(self.error())
    }

    async fn reset(&self, _seed: Option<Seed>) -> Result<(), DomainError> {
        Err(self.error())
    }
}

/// A journal backed by [`MemJournal`] that accepts only the first
/// `writes_before_failure` events of each commit and then fails, leaving the
/// accepted prefix committed the way a non-transactional backend would.
#[derive(Debug)]
pub struct FlakyJournal {
    inner: MemJournal,
    writes_before_failure: usize,
}

impl FlakyJournal {
    #[must_use]
    pub fn new(writes_before_failure: usize) -> Self {
        Self {
            inner: MemJournal::new(),
            writes_before_failure,
        }
    }
}

#[async_trait]
impl Journal for FlakyJournal {
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
        self.inner.find(stream, from)
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        mut events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        if events.len() <= self.writes_before_failure {
            return self.inner.commit(stream, expected_seq, events).await;
        }
        events.truncate(self.writes_before_failure);
        self.inner.commit(stream, expected_seq, events).await?;
        Err(DomainError::Backend("write interrupted".to_owned()))
    }

    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError> {
        self.inner.reset(seed).await
    }
}

/// A journal backed by [`MemJournal`] that persists every commit at once but
/// acknowledges the first one only after `delay`, like a backend whose reply
/// is slow to arrive.
#[derive(Debug)]
pub struct SlowAckJournal {
    inner: MemJournal,
    delay: Duration,
    delayed: AtomicBool,
}

impl SlowAckJournal {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemJournal::new(),
            delay,
            delayed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Journal for SlowAckJournal {
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
        self.inner.find(stream, from)
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        let committed = self.inner.commit(stream, expected_seq, events).await?;
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(committed)
    }

    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError> {
        self.inner.reset(seed).await
    }
}
