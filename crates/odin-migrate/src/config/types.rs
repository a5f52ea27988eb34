//! Configuration type definitions.

use crate::model::{EntityKind, SchoolType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Heimdall (V1) source database.
    pub source: DatabaseConfig,

    /// Odin (V2) target database.
    pub target: DatabaseConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Values used to fill target columns the source leaves empty.
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// PostgreSQL connection settings, used for both source and target.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username (default: "postgres").
    #[serde(default = "default_pg_user")]
    pub user: String,

    /// Password. May be supplied through the environment instead.
    #[serde(default)]
    pub password: String,

    /// Schema holding the tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source rows per batch; one target transaction per batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Halt the whole run on the first row or batch failure.
    #[serde(default)]
    pub fail_fast: bool,

    /// Treat an unresolved student parent reference as a row failure
    /// instead of migrating the student without a parent link.
    #[serde(default)]
    pub strict_parents: bool,

    /// Stages to run. Empty means all stages.
    #[serde(default)]
    pub entities: Vec<EntityKind>,

    /// Source row predicate, e.g. `school_id=42`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Abort the run once a stage's failed/read ratio exceeds this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failure_ratio: Option<f64>,

    /// Retry policy for transient connection errors.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Row errors kept per stage in the summary (default: 10).
    #[serde(default = "default_max_recorded_errors")]
    pub max_recorded_errors: usize,

    /// Domain for emails synthesized for users without one.
    #[serde(default = "default_synthetic_domain")]
    pub synthetic_email_domain: String,

    /// Suffixes tried before an email collision is an error (default: 1000).
    #[serde(default = "default_max_disambiguation_attempts")]
    pub max_disambiguation_attempts: u32,

    /// Create Odin tables if they do not exist (default: true).
    #[serde(default = "default_true")]
    pub create_target_schema: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fail_fast: false,
            strict_parents: false,
            entities: Vec::new(),
            filter: None,
            max_failure_ratio: None,
            retry: RetrySettings::default(),
            max_recorded_errors: default_max_recorded_errors(),
            synthetic_email_domain: default_synthetic_domain(),
            max_disambiguation_attempts: default_max_disambiguation_attempts(),
            create_target_schema: true,
        }
    }
}

impl MigrationConfig {
    /// Stages selected for this run, in stage order.
    pub fn selected_entities(&self) -> Vec<EntityKind> {
        if self.entities.is_empty() {
            return EntityKind::ALL.to_vec();
        }
        let mut kinds = self.entities.clone();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first one (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 200).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the backoff delay in milliseconds (default: 5000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Deadline for a single database operation in milliseconds; a missed
    /// deadline is retried like a dropped connection (default: 300000).
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

/// Documented defaults for non-null Odin columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Country for schools and users (default: "Kenya").
    #[serde(default = "default_country")]
    pub country: String,

    /// County for schools (default: "Nairobi").
    #[serde(default = "default_county")]
    pub county: String,

    /// Dialing code prepended to local phone numbers (default: "254").
    #[serde(default = "default_phone_country_code")]
    pub phone_country_code: String,

    /// School type when the source value is missing or unknown (default: PRIVATE).
    #[serde(default = "default_school_type")]
    pub school_type: SchoolType,

    /// Position recorded for migrated school admins (default: "Principal").
    #[serde(default = "default_admin_position")]
    pub school_admin_position: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            county: default_county(),
            phone_country_code: default_phone_country_code(),
            school_type: default_school_type(),
            school_admin_position: default_admin_position(),
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_recorded_errors() -> usize {
    10
}

fn default_synthetic_domain() -> String {
    "migrated.odin.local".to_string()
}

fn default_max_disambiguation_attempts() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_operation_timeout_ms() -> u64 {
    300_000
}

fn default_country() -> String {
    "Kenya".to_string()
}

fn default_county() -> String {
    "Nairobi".to_string()
}

fn default_phone_country_code() -> String {
    "254".to_string()
}

fn default_school_type() -> SchoolType {
    SchoolType::Private
}

fn default_admin_position() -> String {
    "Principal".to_string()
}
