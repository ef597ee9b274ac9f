//! The ticker aggregate used across the test suites: `Tick` commands emit
//! `Ticked` events, which increment a counter.

use std::sync::Arc;

use omnicron_core::aggregate::Aggregate;
use omnicron_core::command::Command;
use omnicron_core::error::DomainError;
use omnicron_core::event::Event;
use omnicron_core::journal::Journal;
use serde::Serialize;
use serde_json::Value;

/// Command type handled by [`ticker`].
pub const TICK: &str = "Tick";

/// Event type emitted for every [`TICK`].
pub const TICKED: &str = "Ticked";

/// Ticker state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ticks {
    pub ticks: u64,
}

/// Builds a ticker aggregate bound to `journal`.
///
/// # Panics
///
/// Never in practice: the builder only fails without a journal.
#[must_use]
pub fn ticker(journal: Arc<dyn Journal>) -> Aggregate<Ticks> {
    Aggregate::builder(Ticks::default())
        .command(TICK, |_: &Ticks, cmd: &Command| {
            Ok::<_, DomainError>(Event::new(TICKED, cmd.payload.clone()))
        })
        .event(TICKED, |state: &Ticks, _: &Event| Ticks {
            ticks: state.ticks + 1,
        })
        .journal(journal)
        .build()
        .unwrap()
}

/// A `Tick` command for `stream`.
#[must_use]
pub fn tick(stream: &str) -> Command {
    Command::new(TICK, stream.into(), Value::Null)
}
