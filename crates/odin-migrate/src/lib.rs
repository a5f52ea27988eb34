//! # odin-migrate
//!
//! Migrates school data from the Heimdall (V1) schema to the Odin (V2)
//! unified-user schema.
//!
//! Heimdall keeps teachers, parents, and students in separate tables, each
//! with its own login fields. Odin has one `users` table with roles and a
//! profile row per role. The migration:
//!
//! - **Resolves identities** so every email maps to exactly one user
//! - **Runs stages in dependency order**: schools, teachers, parents, students
//! - **Writes one transaction per batch**, continuing past failed batches
//! - **Resumes** from a signed JSON state file holding the ID mapping
//! - **Validates** referential integrity and count reconciliation afterwards
//!
//! ## Example
//!
//! ```rust,no_run
//! use odin_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), odin_migrate::MigrateError> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?.with_validation(true);
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Run {} finished: {}", result.run_id, result.status.as_str());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;
pub mod target;
pub mod tls;
pub mod transform;
pub mod validate;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, DefaultsConfig, MigrationConfig};
pub use error::{MigrateError, Result};
pub use identity::{IdentityResolver, ResolverPolicy};
pub use mapping::IdMapping;
pub use model::EntityKind;
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator, StageSummary};
pub use source::{MemorySource, PgSource, SourceFilter, SourceReader};
pub use state::{MigrationRun, RunStatus};
pub use target::{MemoryTarget, PgTarget, TargetWriter, WriteMode};
pub use validate::{Severity, ValidationReport};
