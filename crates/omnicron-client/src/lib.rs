//! Omnicron Client — reconnecting stream subscriptions.
//!
//! [`StreamSubscription`] is the protocol state machine for one subscribed
//! stream; [`Client`] drives it over a WebSocket.

mod client;
mod error;
mod subscription;

pub use client::Client;
pub use error::ClientError;
pub use subscription::{StreamSubscription, SubscriptionState, default_backoff};
