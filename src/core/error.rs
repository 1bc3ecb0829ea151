use thiserror::Error;

/// Errors raised by a [`Store`](crate::storage::Store).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' already exists in table '{1}'")]
    ColumnExists(String, String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Index '{0}' already exists")]
    IndexExists(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl DbError {
    /// The store refused because the requested object is already there.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::TableExists(_) | Self::ColumnExists(_, _) | Self::IndexExists(_)
        )
    }

    /// The store could not be reached or could not persist.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoError(_) | Self::ConnectionError(_))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Errors of the migration engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrateError {
    /// Target state already matches the desired state.
    #[error("Already applied: {what}")]
    AlreadyApplied { what: String },

    #[error("Unsupported delta kind '{tag}'")]
    UnsupportedDeltaKind { tag: String },

    #[error("Invalid '{tag}' delta: {reason}")]
    InvalidDelta { tag: String, reason: String },

    #[error("Target table '{table}' does not exist")]
    AmbiguousTarget { table: String },

    #[error(
        "Rebuild of '{table}' failed verification: original has {original_rows} rows, shadow has {shadow_rows} ({rejected} rows rejected during copy)"
    )]
    RebuildVerificationFailed {
        table: String,
        original_rows: usize,
        shadow_rows: usize,
        rejected: usize,
    },

    #[error("Shadow table '{shadow}' for '{table}' already exists; inspect and drop it before rebuilding")]
    ShadowTableExists { table: String, shadow: String },

    #[error("Transient connection error: {0}")]
    TransientConnectionError(DbError),

    #[error(transparent)]
    Store(DbError),

    #[error("Migration '{name}' cannot move from {from} to {to}")]
    LedgerTransition { name: String, from: String, to: String },

    #[error("Script error in statement {index}: {message}")]
    Script { index: usize, message: String },

    #[error("Migration source error: {0}")]
    Source(String),

    #[error("Cannot load migration file '{file}': {error}")]
    Load { file: String, error: Box<MigrateError> },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MigrateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConnectionError(_))
    }
}

impl From<DbError> for MigrateError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            Self::TransientConnectionError(err)
        } else {
            Self::Store(err)
        }
    }
}

pub type MigrateResult<T> = std::result::Result<T, MigrateError>;
