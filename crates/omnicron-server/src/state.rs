//! Shared application state.

use std::fmt;
use std::sync::Arc;

use crate::auth::{AllowAll, Authorizer};
use crate::bus::EventBus;
use crate::router::CommandRouter;

/// State shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<CommandRouter>,
    pub bus: EventBus,
    pub authorizer: Arc<dyn Authorizer>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("router", &self.router)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// State that lets every connection subscribe to every stream.
    #[must_use]
    pub fn new(router: CommandRouter, bus: EventBus) -> Self {
        Self {
            router: Arc::new(router),
            bus,
            authorizer: Arc::new(AllowAll),
        }
    }

    /// Replaces the subscription authorizer.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }
}
