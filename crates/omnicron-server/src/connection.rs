//! Per-connection subscription management.
//!
//! A [`Connection`] holds what one client is subscribed to and turns each
//! incoming message into its effect: a subscription change, a routed command
//! whose events are broadcast, or a reply addressed to this client alone.
//! It does no I/O of its own.

use std::collections::HashSet;

use omnicron_core::command::{self, Command};
use omnicron_core::error::DomainError;
use omnicron_core::event::{self, Event, Meta};
use omnicron_core::stream::StreamId;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::state::AppState;

/// One client's session.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    meta: Meta,
    subscriptions: HashSet<StreamId>,
    state: AppState,
}

impl Connection {
    /// Opens a session. `ip` and `agent` are stamped onto every command it
    /// sends, together with the session id.
    #[must_use]
    pub fn new(state: AppState, ip: Option<String>, agent: Option<String>) -> Self {
        let id = Uuid::new_v4();
        let meta = Meta {
            client: Some(id),
            ip,
            agent,
            ..Meta::default()
        };
        info!(connection = %id, ip = ?meta.ip, "connection open");
        Self {
            id,
            meta,
            subscriptions: HashSet::new(),
            state,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Whether this connection holds a subscription for exactly `stream`.
    #[must_use]
    pub fn is_subscribed(&self, stream: &StreamId) -> bool {
        self.subscriptions.contains(stream)
    }

    /// Whether a broadcast event should be delivered here: some subscription
    /// matches its stream and it was not caused by this connection.
    #[must_use]
    pub fn wants(&self, event: &Event) -> bool {
        let subscribed = self
            .subscriptions
            .iter()
            .any(|filter| filter.matches(&event.stream_id));
        subscribed && event.meta.client != Some(self.id)
    }

    /// Handles one raw text frame. Returns the replies for this client.
    pub async fn on_text(&mut self, text: &str) -> Vec<Event> {
        let command = serde_json::from_str::<Value>(text)
            .map_err(|e| DomainError::Validation(format!("malformed message: {e}")))
            .and_then(Command::from_value);

        match command {
            Ok(command) => self.on_command(command).await,
            Err(err) => {
                warn!(connection = %self.id, error = %err, "rejected message");
                vec![error_reply(None, &err)]
            }
        }
    }

    /// Handles one command. Returns the replies for this client.
    pub async fn on_command(&mut self, mut command: Command) -> Vec<Event> {
        command.meta = Meta {
            extra: std::mem::take(&mut command.meta.extra),
            ..self.meta.clone()
        };

        let stream = match command.validate() {
            Ok(stream) => stream.clone(),
            Err(err) => return vec![error_reply(None, &err)],
        };

        match command.command_type.as_str() {
            command::SUBSCRIBE => self.subscribe(stream, command.token.as_deref()).await,
            command::UNSUBSCRIBE => {
                if self.subscriptions.remove(&stream) {
                    info!(connection = %self.id, %stream, "unsubscribed");
                }
                Vec::new()
            }
            _ if !self.is_subscribed(&stream) => {
                let err = DomainError::Routing(format!("not subscribed to {stream}"));
                vec![error_reply(Some(stream), &err)]
            }
            _ => self.dispatch(stream, command).await,
        }
    }

    async fn subscribe(&mut self, stream: StreamId, token: Option<&str>) -> Vec<Event> {
        match self.state.authorizer.authorize(&stream, token).await {
            Ok(()) => {
                info!(connection = %self.id, %stream, "subscribed");
                self.subscriptions.insert(stream);
                Vec::new()
            }
            Err(err @ DomainError::Unauthorized(_)) => {
                warn!(connection = %self.id, %stream, "subscription refused");
                let reply = Event::new(event::UNAUTHORIZED_ERROR, json!({ "message": err.to_string() }))
                    .with_stream(stream);
                vec![reply]
            }
            Err(err) => vec![error_reply(Some(stream), &err)],
        }
    }

    async fn dispatch(&self, stream: StreamId, command: Command) -> Vec<Event> {
        let query = command.is_query();
        match self.state.router.route(command, &self.state.bus).await {
            Ok(events) if query => events,
            Ok(_) => Vec::new(),
            Err(err) => {
                if matches!(err, DomainError::Backend(_)) {
                    error!(connection = %self.id, %stream, error = %err, "command failed");
                } else {
                    warn!(connection = %self.id, %stream, error = %err, "command rejected");
                }
                vec![error_reply(Some(stream), &err)]
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        info!(
            connection = %self.id,
            subscriptions = self.subscriptions.len(),
            "connection closed"
        );
    }
}

/// The `__Error` event sent back for a rejected message.
fn error_reply(stream: Option<StreamId>, err: &DomainError) -> Event {
    Event::new(
        event::ERROR,
        json!({ "error": err.code(), "message": err.to_string() }),
    )
    .with_stream(stream.unwrap_or_default())
}
