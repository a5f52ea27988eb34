//! Error types for the migration library.

use thiserror::Error;

/// Exit code for a run that completed without failures.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration errors (bad YAML, missing fields, bad flags).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for a run that ended in the `failed` state.
pub const EXIT_RUN_FAILED: u8 = 2;
/// Exit code for a run that ended in the `partial` state.
pub const EXIT_RUN_PARTIAL: u8 = 3;
/// Exit code for database connection and pool errors.
pub const EXIT_CONNECTION_ERROR: u8 = 4;
/// Exit code for a cancelled run (SIGINT/SIGTERM).
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for stage ordering violations.
pub const EXIT_ORDERING_VIOLATION: u8 = 6;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient connection failure; safe to retry.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Target rejected a write because of an integrity constraint.
    #[error("Constraint violation{}: {message}", source_id.as_deref().map(|id| format!(" (source id {})", id)).unwrap_or_default())]
    ConstraintViolation {
        source_id: Option<String>,
        message: String,
    },

    /// No unclaimed email could be found within the disambiguation budget.
    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    /// A stage attempted to run before one of its dependencies completed.
    #[error("Stage ordering violation: {0}")]
    OrderingViolation(String),

    /// A source row was mapped twice.
    #[error("Duplicate ID mapping for {kind} source id {source_id}")]
    DuplicateMapping { kind: String, source_id: String },

    /// A source row could not be mapped to target rows.
    #[error("Transform failed for source id {source_id}: {message}")]
    Transform { source_id: String, message: String },

    /// The connection broke during `COMMIT`; the batch may or may not be in the target.
    #[error("Commit outcome unknown: {0}")]
    CommitUncertain(String),

    /// Source database query error
    #[error("Source database error: {0}")]
    Source(#[source] tokio_postgres::Error),

    /// Target database query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use --force to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transform error for a source row.
    pub fn transform(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transform {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Classify a target-side Postgres error.
    ///
    /// Integrity errors (SQLSTATE class 23) become `ConstraintViolation` so they
    /// are recorded against the batch and never retried.
    pub fn from_target(err: tokio_postgres::Error) -> Self {
        match err.code() {
            Some(code) if code.code().starts_with("23") => MigrateError::ConstraintViolation {
                source_id: None,
                message: err
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| err.to_string()),
            },
            _ => MigrateError::Target(err),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only connection-level failures qualify. Constraint violations and
    /// identity exhaustion are logical errors and are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Connection(_) | MigrateError::Pool { .. } => true,
            MigrateError::Source(e) | MigrateError::Target(e) => is_transient_pg(e),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged
            | MigrateError::State(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection(_)
            | MigrateError::Pool { .. }
            | MigrateError::Source(_)
            | MigrateError::Target(_) => EXIT_CONNECTION_ERROR,
            MigrateError::OrderingViolation(_) => EXIT_ORDERING_VIOLATION,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::ConstraintViolation { .. }
            | MigrateError::IdentityResolution(_)
            | MigrateError::DuplicateMapping { .. }
            | MigrateError::Transform { .. }
            | MigrateError::CommitUncertain(_)
            | MigrateError::Json(_) => EXIT_RUN_FAILED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn is_transient_pg(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(code) => {
            let code = code.code();
            // 08: connection exception, 57014: statement_timeout,
            // 57P0x: admin/crash shutdown, 40001/40P01: serialization
            // failure and deadlock.
            code.starts_with("08")
                || matches!(code, "57014" | "57P01" | "57P02" | "57P03" | "40001" | "40P01")
        }
        // No SQLSTATE means the error came from the socket or TLS layer.
        None => err.as_db_error().is_none(),
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
