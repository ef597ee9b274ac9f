//! Aggregates: command execution composed with event replay.
//!
//! An [`Aggregate`] exposes one entry point, [`Aggregate::handle`]. For every
//! command it replays its stream to restore state, executes the command
//! against that state, commits the resulting events at the next expected
//! sequence number and folds the committed events into the returned state.
//!
//! Commands for one stream are handled one at a time. Committed events are
//! handed to a [`Publish`] sink before the next command for that stream
//! starts, so whatever the sink forwards them to sees them in commit order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::command::{self, Command};
use crate::error::DomainError;
use crate::event::{self, Event, Meta};
use crate::journal::{FLOOR, Journal};
use crate::processor::{Apply, EventProcessor};
use crate::stream::StreamId;

/// What a command handler produced: one event or an ordered batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    /// A single event.
    One(Event),
    /// Several events, committed in order.
    Many(Vec<Event>),
}

impl Emitted {
    /// Normalizes to an ordered sequence.
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        match self {
            Self::One(event) => vec![event],
            Self::Many(events) => events,
        }
    }
}

impl From<Event> for Emitted {
    fn from(event: Event) -> Self {
        Self::One(event)
    }
}

impl From<Vec<Event>> for Emitted {
    fn from(events: Vec<Event>) -> Self {
        Self::Many(events)
    }
}

/// Executes one command type against state.
///
/// Plain closures `Fn(&S, &Command) -> Result<impl Into<Emitted>, DomainError>`
/// implement this trait; implement it by hand for handlers that need to
/// await.
#[async_trait]
pub trait CommandHandler<S>: Send + Sync {
    /// Produces the events the command causes, or rejects it.
    async fn handle(&self, state: &S, command: &Command) -> Result<Emitted, DomainError>;
}

#[async_trait]
impl<S, F, E> CommandHandler<S> for F
where
    S: Sync,
    F: Fn(&S, &Command) -> Result<E, DomainError> + Send + Sync,
    E: Into<Emitted>,
{
    async fn handle(&self, state: &S, command: &Command) -> Result<Emitted, DomainError> {
        self(state, command).map(Into::into)
    }
}

/// Capability of executing commands against state.
#[async_trait]
pub trait Exec<S> {
    /// Validates `command` and runs its handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a command without id or stream,
    /// or whatever the handler rejects the command with.
    async fn exec(&self, state: &S, command: &Command) -> Result<Vec<Event>, DomainError>;
}

/// Dispatches commands to one handler per command type.
pub struct CommandProcessor<S> {
    handlers: HashMap<String, Box<dyn CommandHandler<S>>>,
}

impl<S> Default for CommandProcessor<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> fmt::Debug for CommandProcessor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S> CommandProcessor<S> {
    /// Creates a processor with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `command_type`, replacing any previous one.
    pub fn register(
        &mut self,
        command_type: impl Into<String>,
        handler: impl CommandHandler<S> + 'static,
    ) {
        self.handlers.insert(command_type.into(), Box::new(handler));
    }

    /// Whether a handler is registered for `command_type`.
    #[must_use]
    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }
}

#[async_trait]
impl<S: Sync> Exec<S> for CommandProcessor<S> {
    async fn exec(&self, state: &S, command: &Command) -> Result<Vec<Event>, DomainError> {
        command.validate()?;
        let handler = self.handlers.get(&command.command_type).ok_or_else(|| {
            DomainError::Routing(format!(
                "no command handler registered for {}",
                command.command_type
            ))
        })?;

        debug!(command_type = %command.command_type, id = %command.id, "exec");
        Ok(handler.handle(state, command).await?.into_events())
    }
}

/// Result of [`Aggregate::handle`].
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<S> {
    /// Committed events, the raw history for `__replay`, or the single
    /// `__state` event for `__getState`.
    pub events: Vec<Event>,
    /// State after the command. `None` for `__replay`.
    pub state: Option<S>,
}

/// Receives committed events while their stream is still held by the
/// aggregate that committed them.
pub trait Publish: Send + Sync {
    fn publish(&self, events: &[Event]);
}

/// A sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Publish for Discard {
    fn publish(&self, _events: &[Event]) {}
}

/// One lock per stream, serializing writers of that stream.
#[derive(Debug, Default)]
struct WriterLocks {
    streams: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,
}

impl WriterLocks {
    async fn get(&self, stream: &StreamId) -> Arc<Mutex<()>> {
        self.streams
            .lock()
            .await
            .entry(stream.clone())
            .or_default()
            .clone()
    }
}

/// The unit of consistency: one stream type's handlers, initial state and
/// journal.
pub struct Aggregate<S> {
    initial_state: S,
    events: EventProcessor<S>,
    commands: CommandProcessor<S>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    writers: WriterLocks,
}

impl<S> fmt::Debug for Aggregate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("events", &self.events)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Aggregate`]. A journal must be bound before `build`.
pub struct AggregateBuilder<S> {
    initial_state: S,
    events: EventProcessor<S>,
    commands: CommandProcessor<S>,
    journal: Option<Arc<dyn Journal>>,
    clock: Arc<dyn Clock>,
}

impl<S> AggregateBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Registers a command handler.
    #[must_use]
    pub fn command(
        mut self,
        command_type: impl Into<String>,
        handler: impl CommandHandler<S> + 'static,
    ) -> Self {
        self.commands.register(command_type, handler);
        self
    }

    /// Registers an event handler.
    #[must_use]
    pub fn event(
        mut self,
        event_type: impl Into<String>,
        handler: impl Fn(&S, &Event) -> S + Send + Sync + 'static,
    ) -> Self {
        self.events.register(event_type, handler);
        self
    }

    /// Binds the journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Overrides the clock used to stamp synthetic events.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Finishes the aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if no journal was bound.
    pub fn build(self) -> Result<Aggregate<S>, DomainError> {
        let journal = self
            .journal
            .ok_or_else(|| DomainError::Configuration("aggregate has no journal".to_owned()))?;
        Ok(Aggregate {
            initial_state: self.initial_state,
            events: self.events,
            commands: self.commands,
            journal,
            clock: self.clock,
            writers: WriterLocks::default(),
        })
    }
}

impl<S> Aggregate<S>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    /// Starts building an aggregate whose streams fold from `initial_state`.
    #[must_use]
    pub fn builder(initial_state: S) -> AggregateBuilder<S> {
        AggregateBuilder {
            initial_state,
            events: EventProcessor::new(),
            commands: CommandProcessor::new(),
            journal: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// The bound journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// The state every stream starts from.
    #[must_use]
    pub fn initial_state(&self) -> &S {
        &self.initial_state
    }

    /// The event side of this aggregate.
    #[must_use]
    pub fn event_processor(&self) -> &EventProcessor<S> {
        &self.events
    }

    /// The command side of this aggregate.
    #[must_use]
    pub fn command_processor(&self) -> &CommandProcessor<S> {
        &self.commands
    }

    /// Drops this aggregate's cached streams.
    pub async fn reset_cache(&self) {
        self.events.reset_cache().await;
    }

    /// Runs one command through the full state-machine transition.
    ///
    /// - `__replay` returns the stream's raw history and commits nothing.
    /// - `__getState` returns one synthetic `__state` event carrying the
    ///   folded state and commits nothing.
    /// - Every other type replays, executes, commits at
    ///   `last seq + 1` and folds the committed events.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` before touching the journal if the
    /// command lacks an id or stream, `DomainError::Routing` for an
    /// unregistered command type, `DomainError::Conflict` if another writer
    /// got to the stream first, or the journal's backend error.
    pub async fn handle(&self, command: Command) -> Result<Outcome<S>, DomainError> {
        self.handle_and_publish(command, &Discard).await
    }

    /// [`Aggregate::handle`], handing committed events to `sink` before the
    /// next command for the same stream is let through. Queries publish
    /// nothing.
    ///
    /// # Errors
    ///
    /// See [`Aggregate::handle`].
    pub async fn handle_and_publish(
        &self,
        command: Command,
        sink: &dyn Publish,
    ) -> Result<Outcome<S>, DomainError> {
        let stream = command.validate()?.clone();
        let journal = self.journal.as_ref();

        match command.command_type.as_str() {
            command::REPLAY => {
                let (events, _) = self.events.replay_events(journal, &stream, FLOOR).await?;
                debug!(%stream, count = events.len(), "replay returning history");
                Ok(Outcome {
                    events,
                    state: None,
                })
            }
            command::GET_STATE => {
                let (history, last) = self.events.replay_events(journal, &stream, FLOOR).await?;
                let state = history
                    .iter()
                    .fold(self.initial_state.clone(), |state, e| self.events.apply(state, e));
                let snapshot = serde_json::to_value(&state).map_err(|e| {
                    DomainError::Backend(format!("state serialization failed: {e}"))
                })?;

                let mut event =
                    Event::new_at(event::STATE, json!({ "state": snapshot }), self.clock.as_ref())
                        .with_stream(stream)
                        .with_meta(command.meta);
                event.seq = last.unwrap_or(0);

                Ok(Outcome {
                    events: vec![event],
                    state: Some(state),
                })
            }
            _ => {
                if stream.is_wildcard() {
                    return Err(DomainError::Validation(format!(
                        "commands cannot target wildcard stream {stream}"
                    )));
                }
                if !self.commands.handles(&command.command_type) {
                    return Err(DomainError::Routing(format!(
                        "no command handler registered for {}",
                        command.command_type
                    )));
                }

                let writer = self.writers.get(&stream).await;
                let _held = writer.lock().await;

                let (state, last) = self
                    .events
                    .replay(journal, &stream, FLOOR, self.initial_state.clone())
                    .await?;
                let expected_seq = last.unwrap_or(0) + 1;

                let events = self
                    .commands
                    .exec(&state, &command)
                    .await?
                    .into_iter()
                    .map(|mut event| {
                        inherit_meta(&mut event.meta, &command.meta);
                        event
                    })
                    .collect();

                let committed = self.journal.commit(&stream, expected_seq, events).await?;
                self.events.remember(&stream, &committed).await;
                debug!(%stream, expected_seq, count = committed.len(), "committed");
                sink.publish(&committed);

                let state = committed
                    .iter()
                    .fold(state, |state, e| self.events.apply(state, e));
                Ok(Outcome {
                    events: committed,
                    state: Some(state),
                })
            }
        }
    }
}

impl<S> Apply<S> for Aggregate<S> {
    fn apply(&self, state: S, event: &Event) -> S {
        self.events.apply(state, event)
    }
}

#[async_trait]
impl<S: Sync> Exec<S> for Aggregate<S> {
    async fn exec(&self, state: &S, command: &Command) -> Result<Vec<Event>, DomainError> {
        self.commands.exec(state, command).await
    }
}

/// Fills in what the handler left unset from the command's meta. The
/// originating client is always the command's.
fn inherit_meta(meta: &mut Meta, from: &Meta) {
    if from.client.is_some() {
        meta.client = from.client;
    }
    if meta.ip.is_none() {
        meta.ip.clone_from(&from.ip);
    }
    if meta.agent.is_none() {
        meta.agent.clone_from(&from.agent);
    }
    for (key, value) in &from.extra {
        meta.extra.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Type-erased aggregate, as held by a router.
#[async_trait]
pub trait HandleCommand: Send + Sync {
    /// Handles `command`, handing committed events to `sink`, and returns
    /// the resulting events.
    ///
    /// # Errors
    ///
    /// See [`Aggregate::handle`].
    async fn handle_command(
        &self,
        command: Command,
        sink: &dyn Publish,
    ) -> Result<Vec<Event>, DomainError>;
}

#[async_trait]
impl<S> HandleCommand for Aggregate<S>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    async fn handle_command(
        &self,
        command: Command,
        sink: &dyn Publish,
    ) -> Result<Vec<Event>, DomainError> {
        Ok(self.handle_and_publish(command, sink).await?.events)
    }
}
