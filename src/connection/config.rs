use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::core::{MigrateError, MigrateResult};

/// Environment variable consulted by [`ConnectionConfig::from_env`].
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Ephemeral store that lives as long as the process
    Memory { name: String },
    /// Store persisted as a snapshot file
    File { path: PathBuf },
}

/// Where the migration engine connects to.
///
/// Built from a connection string and passed into the runner; nothing in the
/// crate carries a default location or credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub store: StoreKind,

    /// Query-string parameters (`?apikey=...`). Never printed.
    params: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn memory(name: &str) -> Self {
        Self {
            store: StoreKind::Memory { name: name.to_string() },
            params: BTreeMap::new(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreKind::File { path: path.into() },
            params: BTreeMap::new(),
        }
    }

    /// Set a connection parameter
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse from connection string
    ///
    /// Format: `memory://name` or `file://path/to/store.db`, optionally
    /// followed by `?key=value&...`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ConnectionConfig::from_url("file://./data/cmms.db")?;
    /// ```
    pub fn from_url(url: &str) -> MigrateResult<Self> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| MigrateError::Config("URL must look like '<scheme>://<location>'".to_string()))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        if location.is_empty() {
            return Err(MigrateError::Config(format!("URL '{}://' has no location", scheme)));
        }

        let mut config = match scheme.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Self::memory(location),
            "file" => Self::file(location),
            other => {
                return Err(MigrateError::Config(format!(
                    "Unsupported scheme '{}', expected 'memory' or 'file'",
                    other
                )));
            }
        };

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            config = config.param(key, value);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads the connection string from `DATABASE_URL`.
    pub fn from_env() -> MigrateResult<Self> {
        let url = std::env::var(DATABASE_URL_ENV)
            .map_err(|_| MigrateError::Config(format!("{} is not set", DATABASE_URL_ENV)))?;
        Self::from_url(&url)
    }

    /// Convert to connection string with every parameter value masked
    pub fn to_url(&self) -> String {
        let base = match &self.store {
            StoreKind::Memory { name } => format!("memory://{}", name),
            StoreKind::File { path } => format!("file://{}", path.display()),
        };
        if self.params.is_empty() {
            return base;
        }
        let masked: Vec<String> = self.params.keys().map(|k| format!("{}=***", k)).collect();
        format!("{}?{}", base, masked.join("&"))
    }

    /// Validate configuration
    pub fn validate(&self) -> MigrateResult<()> {
        match &self.store {
            StoreKind::Memory { name } if name.trim().is_empty() => {
                Err(MigrateError::Config("Memory store name cannot be empty".to_string()))
            }
            StoreKind::File { path } if path.as_os_str().is_empty() => {
                Err(MigrateError::Config("Store path cannot be empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

// Hand-written so parameter values never reach logs through `{:?}` either.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("store", &self.store)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub const DEFAULT_LEDGER_TABLE: &str = "_schema_migrations";
pub const DEFAULT_SHADOW_SUFFIX: &str = "__shadow";

/// Behaviour of a [`MigrationRunner`](crate::migrate::MigrationRunner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Plan and check every step without writing to the store or the ledger
    pub dry_run: bool,

    /// Table holding the migration ledger
    pub ledger_table: String,

    /// Appended to a table's name to name its rebuild shadow
    pub shadow_suffix: String,
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self {
            dry_run: false,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            shadow_suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn ledger_table(mut self, table: &str) -> Self {
        self.ledger_table = table.to_string();
        self
    }

    pub fn shadow_suffix(mut self, suffix: &str) -> Self {
        self.shadow_suffix = suffix.to_string();
        self
    }

    pub fn validate(&self) -> MigrateResult<()> {
        if self.ledger_table.trim().is_empty() {
            return Err(MigrateError::Config("ledger_table cannot be empty".to_string()));
        }
        if self.shadow_suffix.is_empty() {
            return Err(MigrateError::Config("shadow_suffix cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url() {
        let config = ConnectionConfig::from_url("file://data/cmms.db").unwrap();
        assert_eq!(config.store, StoreKind::File { path: PathBuf::from("data/cmms.db") });

        let config = ConnectionConfig::from_url("memory://scratch").unwrap();
        assert_eq!(config.store, StoreKind::Memory { name: "scratch".into() });
    }

    #[test]
    fn test_invalid_urls() {
        assert!(ConnectionConfig::from_url("cmms.db").is_err());
        assert!(ConnectionConfig::from_url("postgres://host/db").is_err());
        assert!(ConnectionConfig::from_url("file://").is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let config = ConnectionConfig::from_url("file://cmms.db?apikey=not-a-real-key&timeout=30").unwrap();
        assert_eq!(config.get_param("apikey"), Some("not-a-real-key"));

        let shown = config.to_url();
        assert_eq!(shown, "file://cmms.db?apikey=***&timeout=***");
        assert!(!format!("{}", config).contains("not-a-real-key"));
        assert!(!format!("{:?}", config).contains("not-a-real-key"));
    }

    #[test]
    fn test_runner_config_validation() {
        let config = RunnerConfig::new().dry_run(true);
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger_table, "_schema_migrations");

        assert!(RunnerConfig::new().ledger_table(" ").validate().is_err());
        assert!(RunnerConfig::new().shadow_suffix("").validate().is_err());
    }
}
