//! Server configuration, read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::AppError;

/// Which journal backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    Memory,
    Postgres,
}

impl FromStr for JournalKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            other => Err(AppError::Config(format!(
                "JOURNAL must be `memory` or `postgres`, got {other:?}"
            ))),
        }
    }
}

/// Settings for one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub journal: JournalKind,
    /// Required for [`JournalKind::Postgres`].
    pub database_url: Option<String>,
    pub journal_table: String,
    /// Production disables journal resets.
    pub production: bool,
    /// When set, every `__Subscribe` must present this token.
    pub auth_token: Option<String>,
    pub bus_capacity: usize,
}

impl Config {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable is present but invalid, or
    /// `DATABASE_URL` is missing for the postgres journal.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = var("PORT", "3000")
            .parse()
            .map_err(|e| AppError::Config(format!("PORT must be a valid u16: {e}")))?;
        let bus_capacity = var("BUS_CAPACITY", "1024")
            .parse()
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or_else(|| AppError::Config("BUS_CAPACITY must be a positive integer".into()))?;
        let journal: JournalKind = var("JOURNAL", "memory").parse()?;
        let database_url = lookup("DATABASE_URL");
        if journal == JournalKind::Postgres && database_url.is_none() {
            return Err(AppError::Config(
                "DATABASE_URL environment variable must be set for JOURNAL=postgres".into(),
            ));
        }

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port,
            journal,
            database_url,
            journal_table: var("JOURNAL_TABLE", "events"),
            production: var("OMNICRON_ENV", "development") == "production",
            auth_token: lookup("AUTH_TOKEN").filter(|token| !token.is_empty()),
            bus_capacity,
        })
    }

    /// The address to bind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form a socket
    /// address.
    pub fn addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
        assert_eq!(config.journal, JournalKind::Memory);
        assert_eq!(config.journal_table, "events");
        assert!(!config.production);
        assert_eq!(config.auth_token, None);
        assert_eq!(config.bus_capacity, 1024);
    }

    #[test]
    fn test_postgres_journal_requires_database_url() {
        let err = config(&[("JOURNAL", "postgres")]).unwrap_err();

        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_postgres_journal_with_database_url() {
        let config = config(&[
            ("JOURNAL", "postgres"),
            ("DATABASE_URL", "postgres://localhost/omnicron"),
            ("OMNICRON_ENV", "production"),
        ])
        .unwrap();

        assert_eq!(config.journal, JournalKind::Postgres);
        assert!(config.production);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config(&[("PORT", "http")]).is_err());
        assert!(config(&[("BUS_CAPACITY", "0")]).is_err());
        assert!(config(&[("JOURNAL", "dynamo")]).is_err());
    }
}
