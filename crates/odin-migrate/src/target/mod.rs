//! Odin (V2) target writers.
//!
//! A [`TargetWriter`] hands out one [`TargetSession`] per run. Sessions write
//! whole batches atomically: either every unit of a batch is visible after
//! `write_batch` returns `Ok`, or none is.

mod memory;
mod postgres;

pub use memory::{MemoryTables, MemoryTarget, StoredProfile, StoredUser};
pub use postgres::PgTarget;

use crate::error::{MigrateError, Result};
use crate::model::{BatchOutcome, ExistingIdentity, SchoolRef, Subject, TargetId, UserKey, UserRef, WriteBatch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a session treats successful batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Commit each batch.
    Commit,
    /// Apply each batch inside a transaction that is always rolled back.
    DryRun,
}

/// Row counts per Odin table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub schools: u64,
    pub users: u64,
    pub user_roles: u64,
    pub school_admins: u64,
    pub teachers: u64,
    pub parents: u64,
    pub students: u64,
    pub student_parents: u64,
}

/// Profile counts of one school.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolSummary {
    pub school_id: TargetId,
    pub name: String,
    pub teachers: u64,
    pub parents: u64,
    pub students: u64,
}

/// Read access used by the integrity validator.
#[async_trait]
pub trait TargetLookup: Send + Sync {
    async fn user_exists(&self, id: TargetId) -> Result<bool>;

    async fn school_exists(&self, id: TargetId) -> Result<bool>;

    /// Normalized emails held by more than one user.
    async fn duplicate_emails(&self) -> Result<Vec<String>>;

    /// Profile and link rows pointing at a missing user or school, as
    /// `table.column=id` descriptions.
    async fn orphaned_references(&self) -> Result<Vec<String>>;

    async fn row_counts(&self) -> Result<RowCounts>;

    /// Per-school profile counts for `school_ids`, in ID order. Unknown IDs
    /// are left out.
    async fn school_summaries(&self, school_ids: &[TargetId]) -> Result<Vec<SchoolSummary>>;
}

/// Trait for target database operations.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Create the Odin tables if they don't exist.
    async fn prepare_schema(&self) -> Result<()>;

    /// Start a write session.
    async fn begin_session(&self, mode: WriteMode) -> Result<Box<dyn TargetSession>>;

    /// Users already present, for seeding identity resolution.
    async fn existing_identities(&self) -> Result<Vec<ExistingIdentity>>;

    /// Check that the target is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Committed state of the target.
    fn lookup(&self) -> &dyn TargetLookup;

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// One run's writes against the target.
#[async_trait]
pub trait TargetSession: Send + Sync {
    /// Write a batch atomically.
    async fn write_batch(&self, batch: &WriteBatch) -> Result<BatchOutcome>;

    /// End the session. In dry-run mode this discards every write.
    async fn finish(&self) -> Result<()>;

    /// State as seen by this session, including uncommitted dry-run writes.
    fn lookup(&self) -> &dyn TargetLookup;
}

/// Resolves in-batch references while a batch is being applied.
#[derive(Debug, Default)]
pub(crate) struct BatchScope {
    keys: HashMap<UserKey, TargetId>,
    bindings: Vec<(UserKey, TargetId)>,
    unit_school: Option<TargetId>,
}

impl BatchScope {
    /// Reset per-unit state before applying the next unit.
    pub fn start_unit(&mut self) {
        self.unit_school = None;
    }

    pub fn bind_user(&mut self, key: UserKey, id: TargetId) {
        self.keys.insert(key, id);
        self.bindings.push((key, id));
    }

    pub fn bind_school(&mut self, id: TargetId) {
        self.unit_school = Some(id);
    }

    pub fn user(&self, user: UserRef) -> Result<TargetId> {
        match user {
            UserRef::Id(id) => Ok(id),
            UserRef::Key(key) => self.keys.get(&key).copied().ok_or_else(|| {
                MigrateError::State(format!("user key {} referenced before insert", key.0))
            }),
        }
    }

    pub fn school(&self, school: SchoolRef) -> Result<TargetId> {
        match school {
            SchoolRef::Id(id) => Ok(id),
            SchoolRef::Unit => self
                .unit_school
                .ok_or_else(|| MigrateError::State("unit school referenced before insert".into())),
        }
    }

    pub fn subject(&self, subject: Subject) -> Result<TargetId> {
        match subject {
            Subject::School => self.school(SchoolRef::Unit),
            Subject::User(user) => self.user(user),
        }
    }

    pub fn into_bindings(self) -> Vec<(UserKey, TargetId)> {
        self.bindings
    }
}

/// Attach the failing unit's source ID to a constraint violation.
pub(crate) fn attribute(err: MigrateError, source_id: &str) -> MigrateError {
    match err {
        MigrateError::ConstraintViolation {
            source_id: None,
            message,
        } => MigrateError::ConstraintViolation {
            source_id: Some(source_id.to_string()),
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_resolves_refs() {
        let mut scope = BatchScope::default();
        scope.start_unit();
        scope.bind_school(7);
        scope.bind_user(UserKey(1), 100);
        assert_eq!(scope.school(SchoolRef::Unit).unwrap(), 7);
        assert_eq!(scope.school(SchoolRef::Id(3)).unwrap(), 3);
        assert_eq!(scope.user(UserRef::Key(UserKey(1))).unwrap(), 100);
        assert_eq!(scope.user(UserRef::Id(5)).unwrap(), 5);
        assert!(scope.user(UserRef::Key(UserKey(2))).is_err());

        scope.start_unit();
        assert!(scope.school(SchoolRef::Unit).is_err());
        assert_eq!(scope.into_bindings(), vec![(UserKey(1), 100)]);
    }

    #[test]
    fn test_attribute_sets_source_id_once() {
        let err = MigrateError::ConstraintViolation {
            source_id: None,
            message: "dup".into(),
        };
        let err = attribute(err, "T1");
        assert!(err.to_string().contains("source id T1"));
        let err = attribute(err, "T2");
        assert!(err.to_string().contains("source id T1"));
        assert!(matches!(attribute(MigrateError::Cancelled, "T1"), MigrateError::Cancelled));
    }
}
