//! `PostgreSQL` implementation of the `Journal` trait.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{debug, error, info};

use omnicron_core::error::DomainError;
use omnicron_core::event::Event;
use omnicron_core::journal::{self, EventStream, FLOOR, FindFrom, Journal, Seed};
use omnicron_core::stream::StreamId;

use crate::schema;

/// `PostgreSQL` error codes for a table or index that already exists, or a
/// concurrent creation of one.
const ALREADY_EXISTS: [&str; 3] = ["42P07", "42710", "23505"];

/// Settings for a [`PgJournal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgJournalConfig {
    /// Name of the journal table.
    pub table: String,
    /// Whether `reset` may drop the table.
    pub allow_reset: bool,
}

impl Default for PgJournalConfig {
    fn default() -> Self {
        Self {
            table: "events".to_owned(),
            allow_reset: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Queries {
    insert: String,
    scan: String,
    scan_type: String,
    scan_type_since: String,
    scan_stream: String,
}

impl Queries {
    fn new(table: &str) -> Self {
        Self {
            insert: format!(
                r"
INSERT INTO {table} (stream, seq, id, ts, record)
SELECT $1::text, $2::bigint, $3::uuid, $4::timestamptz, $5::jsonb
WHERE $2::bigint = {FLOOR}
   OR EXISTS (SELECT 1 FROM {table} WHERE stream = $1::text AND seq = $2::bigint - 1)
ON CONFLICT (stream, seq) DO NOTHING"
            ),
            scan: format!("SELECT record FROM {table} WHERE seq >= $1 ORDER BY position"),
            scan_type: format!(
                "SELECT record FROM {table} WHERE stream LIKE $1 AND seq >= $2 ORDER BY position"
            ),
            scan_type_since: format!(
                "SELECT record FROM {table} WHERE stream LIKE $1 AND ts >= $2 ORDER BY ts, position"
            ),
            scan_stream: format!(
                "SELECT record FROM {table} WHERE stream = $1 AND seq >= $2 ORDER BY seq"
            ),
        }
    }
}

/// PostgreSQL-backed journal.
///
/// Multi-event commits are not transactional: events are inserted one at a
/// time and a failure part way leaves the earlier ones committed.
#[derive(Debug, Clone)]
pub struct PgJournal {
    pool: PgPool,
    config: PgJournalConfig,
    queries: Queries,
}

impl PgJournal {
    /// Creates a `PgJournal` over `pool`. The table is not touched; call
    /// [`PgJournal::init`] to provision it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the table name is not a plain
    /// lowercase identifier.
    pub fn new(pool: PgPool, config: PgJournalConfig) -> Result<Self, DomainError> {
        if !schema::is_valid_table_name(&config.table) {
            return Err(DomainError::Configuration(format!(
                "invalid journal table name: {:?}",
                config.table
            )));
        }
        let queries = Queries::new(&config.table);
        Ok(Self {
            pool,
            config,
            queries,
        })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the journal table and its indexes. A table that already
    /// exists is left as is.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Backend` if a statement fails for any other
    /// reason.
    pub async fn init(&self) -> Result<(), DomainError> {
        for statement in schema::create_table(&self.config.table) {
            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => {}
                Err(err) if already_exists(&err) => {
                    debug!(table = %self.config.table, "journal table already exists");
                }
                Err(err) => return Err(backend(&err)),
            }
        }
        info!(table = %self.config.table, "journal table ready");
        Ok(())
    }
}

fn already_exists(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| ALREADY_EXISTS.contains(&&*code))
}

fn backend(err: &sqlx::Error) -> DomainError {
    error!(error = %err, "journal backend failure");
    DomainError::Backend(err.to_string())
}

/// Postgres `BIGINT` for a lower bound; bounds past its range match nothing.
fn bound(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

/// `LIKE` pattern matching every key that starts with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Normalizes a record before it is written: empty strings become a single
/// space and NUL characters, which `jsonb` rejects, are dropped.
#[must_use]
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) if s.is_empty() => Value::String(" ".to_owned()),
        Value::String(s) if s.contains('\0') => {
            let cleaned: String = s.chars().filter(|c| *c != '\0').collect();
            sanitize(Value::String(cleaned))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, sanitize(value)))
                .collect(),
        ),
        other => other,
    }
}

#[async_trait]
impl Journal for PgJournal {
    fn find(&self, stream: Option<&StreamId>, from: FindFrom) -> EventStream<'_> {
        if let Err(err) = journal::check_find(stream, from) {
            return journal::failed(err);
        }
        debug!(stream = ?stream.map(StreamId::as_str), ?from, "find");

        let query = match (stream, from) {
            (None, FindFrom::Seq(seq)) => {
                sqlx::query_scalar::<_, Json<Event>>(&self.queries.scan).bind(bound(seq))
            }
            (Some(stream), FindFrom::Seq(seq)) if stream.is_wildcard() => {
                sqlx::query_scalar(&self.queries.scan_type)
                    .bind(prefix_pattern(&stream.type_prefix()))
                    .bind(bound(seq))
            }
            (Some(stream), FindFrom::Timestamp(ts)) => {
                sqlx::query_scalar(&self.queries.scan_type_since)
                    .bind(prefix_pattern(&stream.type_prefix()))
                    .bind(ts)
            }
            (Some(stream), FindFrom::Seq(seq)) => sqlx::query_scalar(&self.queries.scan_stream)
                .bind(stream.to_string())
                .bind(bound(seq)),
            (None, FindFrom::Timestamp(_)) => {
                return journal::failed(DomainError::Validation(
                    "timestamp queries are only valid for wildcard streams".to_owned(),
                ));
            }
        };

        query
            .fetch(&self.pool)
            .map(|row| row.map(|Json(event)| event).map_err(|err| backend(&err)))
            .boxed()
    }

    async fn commit(
        &self,
        stream: &StreamId,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, DomainError> {
        if stream.is_wildcard() {
            return Err(DomainError::Validation(format!(
                "cannot commit to wildcard stream {stream}"
            )));
        }

        let events = journal::sequence(stream, expected_seq, events);
        for event in &events {
            let seq = i64::try_from(event.seq).map_err(|_| {
                DomainError::Validation(format!("sequence number {} out of range", event.seq))
            })?;
            let record = serde_json::to_value(event).map_err(|e| {
                DomainError::Backend(format!("event serialization failed: {e}"))
            })?;

            let result = sqlx::query(&self.queries.insert)
                .bind(stream.as_str())
                .bind(seq)
                .bind(event.id)
                .bind(event.ts)
                .bind(Json(sanitize(record)))
                .execute(&self.pool)
                .await
                .map_err(|err| backend(&err))?;

            if result.rows_affected() == 0 {
                let err = journal::conflict(event);
                debug!(%stream, seq = event.seq, "{err}");
                return Err(err);
            }
        }

        debug!(%stream, expected_seq, count = events.len(), "commit");
        Ok(events)
    }

    async fn reset(&self, seed: Option<Seed>) -> Result<(), DomainError> {
        if !self.config.allow_reset {
            return Err(DomainError::Configuration(
                "journal reset is disabled in production".to_owned(),
            ));
        }

        sqlx::query(&schema::drop_table(&self.config.table))
            .execute(&self.pool)
            .await
            .map_err(|err| backend(&err))?;
        self.init().await?;
        info!(table = %self.config.table, "journal reset");

        match seed {
            Some(seed) => journal::apply_seed(self, seed).await,
            None => Ok(()),
        }
    }
}
