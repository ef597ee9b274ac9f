//! Journal table schema.
//!
//! Each row keeps the routing columns alongside the full event record, so
//! reads never reassemble events from columns.

/// Statements that create the journal table `table` and its indexes.
///
/// Every statement is idempotent.
#[must_use]
pub fn create_table(table: &str) -> [String; 3] {
    [
        format!(
            r"
CREATE TABLE IF NOT EXISTS {table} (
    position    BIGSERIAL NOT NULL,
    stream      TEXT NOT NULL,
    seq         BIGINT NOT NULL,
    id          UUID NOT NULL,
    ts          TIMESTAMPTZ NOT NULL,
    record      JSONB NOT NULL,
    PRIMARY KEY (stream, seq)
)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_position ON {table} (position)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table} (ts, position)"),
    ]
}

/// Statement that drops the journal table `table`.
#[must_use]
pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

/// Whether `table` is usable as an unquoted identifier.
#[must_use]
pub fn is_valid_table_name(table: &str) -> bool {
    let mut chars = table.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && table.len() <= 48
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_plain_identifiers() {
        assert!(is_valid_table_name("events"));
        assert!(is_valid_table_name("_journal_2"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("2events"));
        assert!(!is_valid_table_name("events; DROP TABLE x"));
        assert!(!is_valid_table_name("Events"));
    }

    #[test]
    fn test_create_table_keys_rows_by_stream_and_seq() {
        let [table, ..] = create_table("events");
        assert!(table.contains("PRIMARY KEY (stream, seq)"));
    }
}
