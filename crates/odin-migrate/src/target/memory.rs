//! In-memory Odin target with the same uniqueness and reference rules as the
//! Postgres schema, plus injectable failures for tests.

use super::{
    attribute, BatchScope, RowCounts, SchoolSummary, TargetLookup, TargetSession, TargetWriter, WriteMode,
};
use crate::error::{MigrateError, Result};
use crate::model::{
    BatchOutcome, ExistingIdentity, NewSchool, Profile, Role, TargetId, WriteBatch, WriteOp,
    WriteUnit,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredUser {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub primary_role: Role,
    pub school_id: Option<TargetId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProfile {
    pub user_id: TargetId,
    pub role: Role,
    pub school_id: TargetId,
}

/// Table contents of the in-memory target.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub schools: BTreeMap<TargetId, NewSchool>,
    pub users: BTreeMap<TargetId, StoredUser>,
    pub user_roles: BTreeSet<(TargetId, Role)>,
    pub profiles: Vec<StoredProfile>,
    pub student_parents: Vec<(TargetId, TargetId)>,
    next_id: TargetId,
}

impl MemoryTables {
    fn next_id(&mut self) -> TargetId {
        self.next_id += 1;
        self.next_id
    }

    fn apply_unit(&mut self, unit: &WriteUnit, scope: &mut BatchScope) -> Result<TargetId> {
        scope.start_unit();
        for op in &unit.ops {
            self.apply_op(op, scope)?;
        }
        scope.subject(unit.subject)
    }

    fn apply_op(&mut self, op: &WriteOp, scope: &mut BatchScope) -> Result<()> {
        match op {
            WriteOp::InsertSchool(school) => {
                let id = self.next_id();
                self.schools.insert(id, school.clone());
                scope.bind_school(id);
            }
            WriteOp::InsertUser { key, user } => {
                let email = user.email.to_lowercase();
                if self.users.values().any(|u| u.email.to_lowercase() == email) {
                    return Err(violation(format!("duplicate key value users_email_key: {}", email)));
                }
                if let Some(phone) = &user.phone {
                    if self.users.values().any(|u| u.phone.as_ref() == Some(phone)) {
                        return Err(violation(format!("duplicate key value users_phone_key: {}", phone)));
                    }
                }
                let school_id = user.school.map(|s| scope.school(s)).transpose()?;
                if let Some(school_id) = school_id {
                    self.require_school(school_id)?;
                }
                let id = self.next_id();
                self.users.insert(
                    id,
                    StoredUser {
                        first_name: user.first_name.clone(),
                        middle_name: user.middle_name.clone(),
                        last_name: user.last_name.clone(),
                        email: user.email.clone(),
                        phone: user.phone.clone(),
                        primary_role: user.primary_role,
                        school_id,
                    },
                );
                scope.bind_user(*key, id);
            }
            WriteOp::GrantRole { user, role } => {
                let user_id = scope.user(*user)?;
                self.require_user(user_id)?;
                self.user_roles.insert((user_id, *role));
            }
            WriteOp::InsertProfile { user, profile } => {
                let user_id = scope.user(*user)?;
                self.require_user(user_id)?;
                let school_id = match profile {
                    Profile::SchoolAdmin { school, .. } => scope.school(*school)?,
                    Profile::Teacher { school_id, .. }
                    | Profile::Parent { school_id, .. }
                    | Profile::Student { school_id, .. } => *school_id,
                };
                self.require_school(school_id)?;
                let role = profile.role();
                if self.profiles.iter().any(|p| p.user_id == user_id && p.role == role && p.school_id == school_id) {
                    return Err(violation(format!("duplicate {} profile for user {}", role, user_id)));
                }
                if let Profile::Student { parent_user_ids, .. } = profile {
                    for parent in parent_user_ids {
                        self.require_user(*parent)?;
                        self.student_parents.push((user_id, *parent));
                    }
                }
                self.profiles.push(StoredProfile {
                    user_id,
                    role,
                    school_id,
                });
            }
        }
        Ok(())
    }

    fn require_user(&self, id: TargetId) -> Result<()> {
        if self.users.contains_key(&id) {
            Ok(())
        } else {
            Err(violation(format!("user {} does not exist", id)))
        }
    }

    fn require_school(&self, id: TargetId) -> Result<()> {
        if self.schools.contains_key(&id) {
            Ok(())
        } else {
            Err(violation(format!("school {} does not exist", id)))
        }
    }

    fn counts(&self) -> RowCounts {
        let profiles = |role: Role| self.profiles.iter().filter(|p| p.role == role).count() as u64;
        RowCounts {
            schools: self.schools.len() as u64,
            users: self.users.len() as u64,
            user_roles: self.user_roles.len() as u64,
            school_admins: profiles(Role::SchoolAdmin),
            teachers: profiles(Role::Teacher),
            parents: profiles(Role::Parent),
            students: profiles(Role::Student),
            student_parents: self.student_parents.len() as u64,
        }
    }

    fn school_summaries(&self, school_ids: &[TargetId]) -> Vec<SchoolSummary> {
        let mut ids = school_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| {
                let school = self.schools.get(&id)?;
                let count = |role: Role| {
                    self.profiles
                        .iter()
                        .filter(|p| p.school_id == id && p.role == role)
                        .count() as u64
                };
                Some(SchoolSummary {
                    school_id: id,
                    name: school.name.clone(),
                    teachers: count(Role::Teacher),
                    parents: count(Role::Parent),
                    students: count(Role::Student),
                })
            })
            .collect()
    }

    fn duplicate_emails(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dups = BTreeSet::new();
        for user in self.users.values() {
            let email = user.email.to_lowercase();
            if !seen.insert(email.clone()) {
                dups.insert(email);
            }
        }
        dups.into_iter().collect()
    }

    fn orphans(&self) -> Vec<String> {
        let mut found = Vec::new();
        for p in &self.profiles {
            if !self.users.contains_key(&p.user_id) {
                found.push(format!("{}_profile.user_id={}", p.role.slug(), p.user_id));
            }
            if !self.schools.contains_key(&p.school_id) {
                found.push(format!("{}_profile.school_id={}", p.role.slug(), p.school_id));
            }
        }
        for (student, parent) in &self.student_parents {
            for id in [student, parent] {
                if !self.users.contains_key(id) {
                    found.push(format!("student_parents.user_id={}", id));
                }
            }
        }
        found
    }

    fn identities(&self) -> Vec<ExistingIdentity> {
        self.users
            .iter()
            .map(|(id, u)| ExistingIdentity {
                id: *id,
                first_name: u.first_name.clone(),
                middle_name: u.middle_name.clone(),
                last_name: u.last_name.clone(),
                email: u.email.clone(),
                phone: u.phone.clone(),
                roles: self
                    .user_roles
                    .iter()
                    .filter(|(uid, _)| uid == id)
                    .map(|(_, role)| *role)
                    .collect(),
            })
            .collect()
    }
}

fn violation(message: String) -> MigrateError {
    MigrateError::ConstraintViolation {
        source_id: None,
        message,
    }
}

#[derive(Debug, Default)]
struct Failures {
    transient_writes: AtomicU32,
    lost_commit_acks: AtomicU32,
    constraint_ids: Mutex<HashSet<String>>,
}

impl Failures {
    fn check(&self, batch: &WriteBatch) -> Result<()> {
        let transient = self
            .transient_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(MigrateError::Connection("injected transient write failure".into()));
        }
        let ids = self.constraint_ids.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(unit) = batch.units.iter().find(|u| ids.contains(&u.source_id)) {
            return Err(MigrateError::ConstraintViolation {
                source_id: Some(unit.source_id.clone()),
                message: "injected constraint violation".into(),
            });
        }
        Ok(())
    }

    fn commit_ack_lost(&self) -> bool {
        self.lost_commit_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory target.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    tables: Arc<AsyncMutex<MemoryTables>>,
    failures: Arc<Failures>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures.transient_writes.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` batch writes but report their commit outcome as unknown.
    pub fn lose_next_commit_acks(&self, n: u32) {
        self.failures.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Reject every batch containing `source_id` with a constraint violation.
    pub fn fail_on_source_id(&self, source_id: &str) {
        self.failures
            .constraint_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source_id.to_string());
    }

    /// Copy of the committed tables.
    pub async fn tables(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

#[async_trait]
impl TargetLookup for AsyncMutex<MemoryTables> {
    async fn user_exists(&self, id: TargetId) -> Result<bool> {
        Ok(self.lock().await.users.contains_key(&id))
    }

    async fn school_exists(&self, id: TargetId) -> Result<bool> {
        Ok(self.lock().await.schools.contains_key(&id))
    }

    async fn duplicate_emails(&self) -> Result<Vec<String>> {
        Ok(self.lock().await.duplicate_emails())
    }

    async fn orphaned_references(&self) -> Result<Vec<String>> {
        Ok(self.lock().await.orphans())
    }

    async fn row_counts(&self) -> Result<RowCounts> {
        Ok(self.lock().await.counts())
    }

    async fn school_summaries(&self, school_ids: &[TargetId]) -> Result<Vec<SchoolSummary>> {
        Ok(self.lock().await.school_summaries(school_ids))
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn prepare_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn begin_session(&self, mode: WriteMode) -> Result<Box<dyn TargetSession>> {
        let tables = match mode {
            WriteMode::Commit => self.tables.clone(),
            WriteMode::DryRun => Arc::new(AsyncMutex::new(self.tables.lock().await.clone())),
        };
        Ok(Box::new(MemorySession {
            tables,
            failures: self.failures.clone(),
        }))
    }

    async fn existing_identities(&self) -> Result<Vec<ExistingIdentity>> {
        Ok(self.tables.lock().await.identities())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn lookup(&self) -> &dyn TargetLookup {
        self.tables.as_ref()
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

struct MemorySession {
    tables: Arc<AsyncMutex<MemoryTables>>,
    failures: Arc<Failures>,
}

#[async_trait]
impl TargetSession for MemorySession {
    async fn write_batch(&self, batch: &WriteBatch) -> Result<BatchOutcome> {
        self.failures.check(batch)?;

        let mut tables = self.tables.lock().await;
        let mut working = tables.clone();
        let mut scope = BatchScope::default();
        let mut unit_ids = Vec::with_capacity(batch.units.len());
        for unit in &batch.units {
            let id = working
                .apply_unit(unit, &mut scope)
                .map_err(|e| attribute(e, &unit.source_id))?;
            unit_ids.push(id);
        }
        *tables = working;
        if self.failures.commit_ack_lost() {
            return Err(MigrateError::CommitUncertain(format!(
                "{} batch: injected lost commit acknowledgement",
                batch.kind
            )));
        }
        Ok(BatchOutcome {
            unit_ids,
            bindings: scope.into_bindings(),
        })
    }

    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn lookup(&self) -> &dyn TargetLookup {
        self.tables.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, NewUser, SchoolRef, SchoolType, Subject, UserKey, UserRef};

    fn school() -> NewSchool {
        NewSchool {
            name: "Greenfield".into(),
            email: None,
            phone: None,
            code: None,
            level: None,
            motto: None,
            vision: None,
            country: "Kenya".into(),
            county: "Nairobi".into(),
            logo: None,
            address: None,
            school_type: SchoolType::Private,
            is_active: true,
            is_verified: false,
        }
    }

    fn user(email: &str) -> NewUser {
        NewUser {
            first_name: "Jane".into(),
            middle_name: None,
            last_name: None,
            email: email.into(),
            phone: None,
            password: None,
            profile_picture: None,
            primary_role: Role::Teacher,
            is_active: true,
            is_verified: true,
            school: None,
            country: "Kenya".into(),
        }
    }

    fn school_batch(id: &str) -> WriteBatch {
        WriteBatch {
            kind: EntityKind::Schools,
            units: vec![WriteUnit {
                source_id: id.into(),
                subject: Subject::School,
                ops: vec![WriteOp::InsertSchool(school())],
            }],
        }
    }

    fn user_unit(id: &str, key: u64, email: &str) -> WriteUnit {
        WriteUnit {
            source_id: id.into(),
            subject: Subject::User(UserRef::Key(UserKey(key))),
            ops: vec![
                WriteOp::InsertUser {
                    key: UserKey(key),
                    user: user(email),
                },
                WriteOp::GrantRole {
                    user: UserRef::Key(UserKey(key)),
                    role: Role::Teacher,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_commit_and_counts() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        let outcome = session.write_batch(&school_batch("S1")).await.unwrap();
        assert_eq!(outcome.unit_ids.len(), 1);
        assert!(target.lookup().school_exists(outcome.unit_ids[0]).await.unwrap());
        assert_eq!(target.lookup().row_counts().await.unwrap().schools, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_rows() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        let batch = WriteBatch {
            kind: EntityKind::Teachers,
            units: vec![user_unit("T1", 1, "a@x.com"), user_unit("T2", 2, "A@x.com")],
        };
        let err = session.write_batch(&batch).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::ConstraintViolation { source_id: Some(ref id), .. } if id == "T2"
        ));
        assert_eq!(target.lookup().row_counts().await.unwrap(), RowCounts::default());
    }

    #[tokio::test]
    async fn test_dry_run_is_private() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::DryRun).await.unwrap();
        session.write_batch(&school_batch("S1")).await.unwrap();
        assert_eq!(session.lookup().row_counts().await.unwrap().schools, 1);
        session.finish().await.unwrap();
        assert_eq!(target.lookup().row_counts().await.unwrap().schools, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        target.fail_next_writes(1);
        assert!(session.write_batch(&school_batch("S1")).await.unwrap_err().is_transient());
        session.write_batch(&school_batch("S1")).await.unwrap();

        target.fail_on_source_id("S2");
        let err = session.write_batch(&school_batch("S2")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_lost_commit_ack_keeps_the_batch() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        target.lose_next_commit_acks(1);
        let err = session.write_batch(&school_batch("S1")).await.unwrap_err();
        assert!(matches!(err, MigrateError::CommitUncertain(_)));
        assert!(!err.is_transient());
        assert_eq!(target.tables().await.schools.len(), 1);
    }

    #[tokio::test]
    async fn test_profile_requires_school() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        let mut unit = user_unit("T1", 1, "a@x.com");
        unit.ops.push(WriteOp::InsertProfile {
            user: UserRef::Key(UserKey(1)),
            profile: Profile::SchoolAdmin {
                school: SchoolRef::Id(99),
                is_main: true,
                position: "Principal".into(),
            },
        });
        let batch = WriteBatch {
            kind: EntityKind::Teachers,
            units: vec![unit],
        };
        assert!(session.write_batch(&batch).await.is_err());
    }

    #[tokio::test]
    async fn test_existing_identities_carry_roles() {
        let target = MemoryTarget::new();
        let session = target.begin_session(WriteMode::Commit).await.unwrap();
        let batch = WriteBatch {
            kind: EntityKind::Teachers,
            units: vec![user_unit("T1", 1, "a@x.com")],
        };
        let outcome = session.write_batch(&batch).await.unwrap();
        assert_eq!(outcome.bindings, vec![(UserKey(1), outcome.unit_ids[0])]);
        let existing = target.existing_identities().await.unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].roles, vec![Role::Teacher]);
    }
}
