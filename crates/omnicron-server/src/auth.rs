//! Subscription authorization.

use async_trait::async_trait;
use omnicron_core::error::DomainError;
use omnicron_core::stream::StreamId;

/// Decides whether a connection may subscribe to a stream.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// # Errors
    ///
    /// Returns `DomainError::Unauthorized` to refuse the subscription.
    async fn authorize(&self, stream: &StreamId, token: Option<&str>) -> Result<(), DomainError>;
}

/// Accepts every subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _stream: &StreamId, _token: Option<&str>) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Accepts subscriptions presenting one shared token.
#[derive(Debug, Clone)]
pub struct SharedToken(String);

impl SharedToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl Authorizer for SharedToken {
    async fn authorize(&self, stream: &StreamId, token: Option<&str>) -> Result<(), DomainError> {
        if token == Some(self.0.as_str()) {
            Ok(())
        } else {
            Err(DomainError::Unauthorized(format!("invalid token for {stream}")))
        }
    }
}
