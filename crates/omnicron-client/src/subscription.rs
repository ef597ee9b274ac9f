//! Per-stream subscription state machine.
//!
//! ```text
//! Connecting --on_open--> Open --queue drained--> Subscribed
//!     ^                                       |
//!     +------- on_close(unclean), retry ------+
//!
//! any --unauthorized / clean close / retries exhausted / unsubscribe--> Closed
//! ```
//!
//! Outgoing commands are queued while the socket is not open and sent, in
//! order, right after the `__Subscribe` message each time it opens. A queued
//! command leaves the queue only once its write is confirmed, so a socket
//! lost halfway through the drain resends the rest after reconnecting.

use std::collections::VecDeque;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use omnicron_core::command::{self, Command};
use omnicron_core::event::{self, Event};
use omnicron_core::stream::StreamId;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// Reconnect backoff used when none is given.
///
/// - Min delay: 100ms
/// - Max delay: 3s
/// - Max attempts: 30
/// - Jitter enabled
#[must_use]
pub fn default_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(3))
        .with_max_times(30)
        .with_jitter()
}

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the socket to open, initially or after an unclean close.
    Connecting,
    /// Socket open, `__Subscribe` handed out, queue not yet drained.
    Open,
    /// Subscribed; commands go straight out.
    Subscribed,
    /// Terminal.
    Closed,
}

/// One stream's subscription.
#[derive(Debug)]
pub struct StreamSubscription {
    stream: StreamId,
    token: Option<String>,
    state: SubscriptionState,
    queue: VecDeque<Command>,
    backoff_policy: ExponentialBuilder,
    backoff: ExponentialBackoff,
}

impl StreamSubscription {
    /// A subscription to `stream`, presenting `token` on every subscribe.
    #[must_use]
    pub fn new(stream: StreamId, token: Option<String>) -> Self {
        Self::with_backoff(stream, token, default_backoff())
    }

    /// Like [`StreamSubscription::new`] with a custom reconnect backoff.
    #[must_use]
    pub fn with_backoff(stream: StreamId, token: Option<String>, policy: ExponentialBuilder) -> Self {
        Self {
            stream,
            token,
            state: SubscriptionState::Connecting,
            queue: VecDeque::new(),
            backoff_policy: policy,
            backoff: policy.build(),
        }
    }

    #[must_use]
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Number of commands waiting for the socket to open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The socket opened. Returns the `__Subscribe` message to send first.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` for a closed subscription.
    pub fn on_open(&mut self) -> Result<Command, ClientError> {
        if self.state == SubscriptionState::Closed {
            return Err(ClientError::Closed);
        }
        self.state = SubscriptionState::Open;
        self.backoff = self.backoff_policy.build();
        info!(stream = %self.stream, "socket open, subscribing");

        let mut subscribe = Command::new(command::SUBSCRIBE, self.stream.clone(), Value::Null);
        subscribe.token.clone_from(&self.token);
        Ok(subscribe)
    }

    /// The oldest queued command to write while the socket is open. It stays
    /// queued until [`StreamSubscription::confirm_sent`]. Once the queue is
    /// empty the subscription is complete and this returns `None`.
    pub fn next_queued(&mut self) -> Option<Command> {
        if self.state != SubscriptionState::Open {
            return None;
        }
        let next = self.queue.front().cloned();
        if next.is_none() {
            debug!(stream = %self.stream, "queue drained");
            self.state = SubscriptionState::Subscribed;
        }
        next
    }

    /// The command last returned by [`StreamSubscription::next_queued`] was
    /// written.
    pub fn confirm_sent(&mut self) {
        if self.state == SubscriptionState::Open {
            self.queue.pop_front();
        }
    }

    /// Offers an outgoing command. Returns it back when it can be sent now;
    /// otherwise it is queued.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` for a closed subscription.
    pub fn send(&mut self, command: Command) -> Result<Option<Command>, ClientError> {
        match self.state {
            SubscriptionState::Subscribed => Ok(Some(command)),
            SubscriptionState::Connecting | SubscriptionState::Open => {
                self.queue.push_back(command);
                Ok(None)
            }
            SubscriptionState::Closed => Err(ClientError::Closed),
        }
    }

    /// Filters an incoming event. Returns it when it belongs to this stream.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Unauthorized`, and closes the subscription, when
    /// the server refused it.
    pub fn on_event(&mut self, event: Event) -> Result<Option<Event>, ClientError> {
        if self.state == SubscriptionState::Closed || !self.stream.matches(&event.stream_id) {
            return Ok(None);
        }
        if event.event_type == event::UNAUTHORIZED_ERROR {
            warn!(stream = %self.stream, "subscription refused");
            self.close();
            let message = event.payload["message"]
                .as_str()
                .unwrap_or("unauthorized")
                .to_owned();
            return Err(ClientError::Unauthorized {
                stream: self.stream.to_string(),
                message,
            });
        }
        Ok(Some(event))
    }

    /// The socket closed. Returns the delay before reconnecting, or `None`
    /// when the subscription is over: the close was clean, it was already
    /// closed, or retries are exhausted.
    pub fn on_close(&mut self, clean: bool) -> Option<Duration> {
        if clean || self.state == SubscriptionState::Closed {
            self.close();
            return None;
        }
        match self.backoff.next() {
            Some(delay) => {
                self.state = SubscriptionState::Connecting;
                info!(stream = %self.stream, ?delay, "connection lost, reconnecting");
                Some(delay)
            }
            None => {
                warn!(stream = %self.stream, "reconnect attempts exhausted");
                self.close();
                None
            }
        }
    }

    /// Ends the subscription. Returns the `__Unsubscribe` message when the
    /// server currently knows about it.
    pub fn unsubscribe(&mut self) -> Option<Command> {
        let subscribed = matches!(
            self.state,
            SubscriptionState::Open | SubscriptionState::Subscribed
        );
        self.close();
        subscribed.then(|| Command::new(command::UNSUBSCRIBE, self.stream.clone(), Value::Null))
    }

    fn close(&mut self) {
        self.state = SubscriptionState::Closed;
        self.queue.clear();
    }
}
