//! Omnicron Core — event-sourcing runtime.
//!
//! State is never stored directly. It is derived by folding an append-only
//! journal of immutable events, and changed by executing commands against that
//! derived state and committing the resulting events under optimistic
//! concurrency control. This crate holds the record model, the `Journal`
//! contract with its in-memory reference implementation, and the aggregate
//! runtime. It contains no network code.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod journal;
pub mod mem_journal;
pub mod processor;
pub mod stream;
