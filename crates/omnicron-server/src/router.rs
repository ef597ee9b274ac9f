//! Routes commands to aggregates by stream type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use omnicron_core::aggregate::{HandleCommand, Publish};
use omnicron_core::command::Command;
use omnicron_core::error::DomainError;
use omnicron_core::event::Event;
use tracing::{debug, info};

/// Maps each stream type to at most one aggregate.
#[derive(Default, Clone)]
pub struct CommandRouter {
    routes: HashMap<String, Arc<dyn HandleCommand>>,
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("stream_types", &self.stream_types())
            .finish()
    }
}

impl CommandRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `aggregate` for `stream_type`, replacing any previous one.
    pub fn register(&mut self, stream_type: impl Into<String>, aggregate: Arc<dyn HandleCommand>) {
        let stream_type = stream_type.into();
        info!(%stream_type, "aggregate registered");
        self.routes.insert(stream_type, aggregate);
    }

    /// Builder form of [`CommandRouter::register`].
    #[must_use]
    pub fn with(mut self, stream_type: impl Into<String>, aggregate: Arc<dyn HandleCommand>) -> Self {
        self.register(stream_type, aggregate);
        self
    }

    /// Registered stream types, sorted.
    #[must_use]
    pub fn stream_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Hands `command` to the aggregate registered for its stream type.
    /// Committed events go to `sink`; the returned events are what the
    /// aggregate produced.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a command without id or stream,
    /// `DomainError::Routing` when no aggregate handles the stream type, or
    /// the aggregate's own error.
    pub async fn route(
        &self,
        command: Command,
        sink: &dyn Publish,
    ) -> Result<Vec<Event>, DomainError> {
        let stream_type = command.validate()?.stream_type().to_owned();
        let aggregate = self.routes.get(&stream_type).ok_or_else(|| {
            DomainError::Routing(format!("no aggregate registered for stream type {stream_type}"))
        })?;

        debug!(%stream_type, command_type = %command.command_type, "route");
        aggregate.handle_command(command, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicron_core::aggregate::Discard;
    use omnicron_core::mem_journal::MemJournal;
    use omnicron_test_support::{TICKED, tick, ticker};
    use serde_json::Value;

    fn router() -> CommandRouter {
        CommandRouter::new().with("ticker", Arc::new(ticker(Arc::new(MemJournal::new()))))
    }

    #[tokio::test]
    async fn test_routes_by_stream_type() {
        let router = router();

        let events = router.route(tick("ticker:1"), &Discard).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TICKED);
        assert_eq!(events[0].seq, 1);
    }

    #[tokio::test]
    async fn test_unregistered_stream_type_is_a_routing_error() {
        let router = router();

        let err = router
            .route(Command::new("Send", "email:1".into(), Value::Null), &Discard)
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Routing(_)));
    }

    #[test]
    fn test_stream_types_are_listed_sorted() {
        let journal = Arc::new(MemJournal::new());
        let router = CommandRouter::new()
            .with("ticker", Arc::new(ticker(journal.clone())))
            .with("clock", Arc::new(ticker(journal)));

        assert_eq!(router.stream_types(), vec!["clock", "ticker"]);
    }
}
