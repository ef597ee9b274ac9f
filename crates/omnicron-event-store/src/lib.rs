//! Omnicron Event Store — durable `Journal` backed by `PostgreSQL`.
//!
//! Events are written one row at a time, each insert conditional on its
//! `(stream, seq)` position being free and on its predecessor existing.

pub mod pg_journal;
pub mod schema;
