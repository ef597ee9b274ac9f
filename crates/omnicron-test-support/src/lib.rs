//! Shared test journals, clocks and fixtures for Omnicron.

mod clock;
mod journal;
mod ticker;

pub use clock::{FixedClock, SteppingClock};
pub use journal::{FailingJournal, FlakyJournal, RecordingJournal, SlowAckJournal};
pub use ticker::{TICK, TICKED, Ticks, tick, ticker};
