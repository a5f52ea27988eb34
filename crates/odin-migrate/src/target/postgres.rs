//! PostgreSQL writer for the Odin schema.
//!
//! Commit sessions take a pooled connection per batch and wrap the batch in
//! `BEGIN`/`COMMIT`. Dry-run sessions pin one connection for the whole run,
//! open an outer transaction, put each batch under a savepoint, and roll
//! the outer transaction back in `finish`.

use super::{
    attribute, BatchScope, RowCounts, SchoolSummary, TargetLookup, TargetSession, TargetWriter, WriteMode,
};
use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::model::{BatchOutcome, ExistingIdentity, Profile, Role, TargetId, WriteBatch, WriteOp, WriteUnit};
use crate::source::quote_ident;
use crate::tls::connect_pool;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

const SAVEPOINT: &str = "odin_batch";

/// Schema-qualified statements, built once per target.
#[derive(Debug)]
struct Sql {
    schema: String,
    ddl: String,
    insert_school: String,
    insert_user: String,
    grant_role: String,
    insert_school_admin: String,
    insert_teacher: String,
    insert_parent: String,
    insert_student: String,
    insert_student_parent: String,
    user_exists: String,
    school_exists: String,
    duplicate_emails: String,
    orphans: String,
    row_counts: String,
    school_summaries: String,
    identities: String,
}

impl Sql {
    fn new(schema: &str) -> Self {
        let s = quote_ident(schema);
        Self {
            schema: schema.to_string(),
            ddl: schema_ddl(&s),
            insert_school: format!(
                "INSERT INTO {s}.schools (name, email, phone, code, level, motto, vision, country, \
                 county, logo, address, school_type, is_active, is_verified) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) RETURNING id"
            ),
            insert_user: format!(
                "INSERT INTO {s}.users (first_name, middle_name, last_name, email, phone, password, \
                 is_password_set, profile_picture, primary_role, is_active, is_verified, school_id, country) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING id"
            ),
            grant_role: format!(
                "INSERT INTO {s}.user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING"
            ),
            insert_school_admin: format!(
                "INSERT INTO {s}.school_admins (user_id, school_id, is_main, position) VALUES ($1, $2, $3, $4)"
            ),
            insert_teacher: format!(
                "INSERT INTO {s}.teachers (user_id, school_id, subject_specialization, employment_date, is_active) \
                 VALUES ($1, $2, $3, $4, $5)"
            ),
            insert_parent: format!(
                "INSERT INTO {s}.parents (user_id, school_id, parent_type) VALUES ($1, $2, $3)"
            ),
            insert_student: format!(
                "INSERT INTO {s}.students (user_id, school_id, admission_number, gender, enrollment_date) \
                 VALUES ($1, $2, $3, $4, $5)"
            ),
            insert_student_parent: format!(
                "INSERT INTO {s}.student_parents (student_user_id, parent_user_id) VALUES ($1, $2)"
            ),
            user_exists: format!("SELECT EXISTS (SELECT 1 FROM {s}.users WHERE id = $1)"),
            school_exists: format!("SELECT EXISTS (SELECT 1 FROM {s}.schools WHERE id = $1)"),
            duplicate_emails: format!(
                "SELECT lower(email) FROM {s}.users GROUP BY lower(email) HAVING COUNT(*) > 1 ORDER BY 1"
            ),
            orphans: orphans_query(&s),
            row_counts: format!(
                "SELECT (SELECT COUNT(*) FROM {s}.schools), (SELECT COUNT(*) FROM {s}.users), \
                 (SELECT COUNT(*) FROM {s}.user_roles), (SELECT COUNT(*) FROM {s}.school_admins), \
                 (SELECT COUNT(*) FROM {s}.teachers), (SELECT COUNT(*) FROM {s}.parents), \
                 (SELECT COUNT(*) FROM {s}.students), (SELECT COUNT(*) FROM {s}.student_parents)"
            ),
            school_summaries: format!(
                "SELECT sc.id, sc.name, \
                 (SELECT COUNT(*) FROM {s}.teachers t WHERE t.school_id = sc.id), \
                 (SELECT COUNT(*) FROM {s}.parents p WHERE p.school_id = sc.id), \
                 (SELECT COUNT(*) FROM {s}.students st WHERE st.school_id = sc.id) \
                 FROM {s}.schools sc WHERE sc.id = ANY($1) ORDER BY sc.id"
            ),
            identities: format!(
                "SELECT u.id, u.first_name, u.middle_name, u.last_name, u.email, u.phone, \
                 COALESCE(array_agg(r.role ORDER BY r.role) FILTER (WHERE r.role IS NOT NULL), ARRAY[]::text[]) \
                 FROM {s}.users u LEFT JOIN {s}.user_roles r ON r.user_id = u.id \
                 GROUP BY u.id ORDER BY u.id"
            ),
        }
    }
}

fn schema_ddl(s: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {s};
CREATE TABLE IF NOT EXISTS {s}.schools (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    code TEXT,
    level TEXT,
    motto TEXT,
    vision TEXT,
    country TEXT NOT NULL,
    county TEXT NOT NULL,
    logo TEXT,
    address TEXT,
    school_type TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT true,
    is_verified BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS {s}.users (
    id BIGSERIAL PRIMARY KEY,
    first_name TEXT NOT NULL,
    middle_name TEXT,
    last_name TEXT,
    email TEXT NOT NULL,
    phone TEXT UNIQUE,
    password TEXT,
    is_password_set BOOLEAN NOT NULL DEFAULT false,
    profile_picture TEXT,
    primary_role TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT true,
    is_verified BOOLEAN NOT NULL DEFAULT false,
    school_id BIGINT REFERENCES {s}.schools(id),
    country TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS users_email_lower_key ON {s}.users (lower(email));
CREATE TABLE IF NOT EXISTS {s}.user_roles (
    user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    role TEXT NOT NULL,
    PRIMARY KEY (user_id, role)
);
CREATE TABLE IF NOT EXISTS {s}.school_admins (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    school_id BIGINT NOT NULL REFERENCES {s}.schools(id),
    is_main BOOLEAN NOT NULL DEFAULT false,
    position TEXT NOT NULL,
    UNIQUE (user_id, school_id)
);
CREATE TABLE IF NOT EXISTS {s}.teachers (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    school_id BIGINT NOT NULL REFERENCES {s}.schools(id),
    subject_specialization TEXT,
    employment_date DATE NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT true,
    UNIQUE (user_id, school_id)
);
CREATE TABLE IF NOT EXISTS {s}.parents (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    school_id BIGINT NOT NULL REFERENCES {s}.schools(id),
    parent_type TEXT NOT NULL,
    UNIQUE (user_id, school_id)
);
CREATE TABLE IF NOT EXISTS {s}.students (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL UNIQUE REFERENCES {s}.users(id),
    school_id BIGINT NOT NULL REFERENCES {s}.schools(id),
    admission_number TEXT,
    gender TEXT NOT NULL,
    enrollment_date DATE NOT NULL
);
CREATE TABLE IF NOT EXISTS {s}.student_parents (
    student_user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    parent_user_id BIGINT NOT NULL REFERENCES {s}.users(id),
    PRIMARY KEY (student_user_id, parent_user_id)
);
"#
    )
}

fn orphans_query(s: &str) -> String {
    let user_checks = [
        ("user_roles", "user_id"),
        ("school_admins", "user_id"),
        ("teachers", "user_id"),
        ("parents", "user_id"),
        ("students", "user_id"),
        ("student_parents", "student_user_id"),
        ("student_parents", "parent_user_id"),
    ];
    let school_checks = [
        ("school_admins", "school_id"),
        ("teachers", "school_id"),
        ("parents", "school_id"),
        ("students", "school_id"),
    ];
    let mut parts: Vec<String> = user_checks
        .iter()
        .map(|(table, col)| {
            format!(
                "SELECT '{table}.{col}=' || t.{col} FROM {s}.{table} t \
                 LEFT JOIN {s}.users p ON p.id = t.{col} WHERE p.id IS NULL"
            )
        })
        .collect();
    parts.extend(school_checks.iter().map(|(table, col)| {
        format!(
            "SELECT '{table}.{col}=' || t.{col} FROM {s}.{table} t \
             LEFT JOIN {s}.schools p ON p.id = t.{col} WHERE p.id IS NULL"
        )
    }));
    parts.join(" UNION ALL ")
}

/// PostgreSQL target.
pub struct PgTarget {
    pool: Pool,
    sql: Arc<Sql>,
    create_schema: bool,
    operation_timeout: Duration,
}

impl PgTarget {
    /// Connect to the Odin database.
    pub async fn connect(
        config: &DatabaseConfig,
        create_schema: bool,
        operation_timeout: Duration,
    ) -> Result<Self> {
        let pool = connect_pool(config, "target", operation_timeout).await?;
        Ok(Self::from_pool(pool, &config.schema, create_schema, operation_timeout))
    }

    pub fn from_pool(pool: Pool, schema: &str, create_schema: bool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            sql: Arc::new(Sql::new(schema)),
            create_schema,
            operation_timeout,
        }
    }

    async fn client(&self) -> Result<Object> {
        get_client(&self.pool).await
    }

    async fn tables_exist(&self, client: &Client) -> Result<bool> {
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = 'users')",
                &[&self.sql.schema],
            )
            .await?;
        Ok(row.try_get(0)?)
    }
}

async fn get_client(pool: &Pool) -> Result<Object> {
    pool.get()
        .await
        .map_err(|e| MigrateError::pool(e, "getting target connection"))
}

#[async_trait]
impl TargetWriter for PgTarget {
    async fn prepare_schema(&self) -> Result<()> {
        if !self.create_schema {
            debug!("Skipping target DDL; create_target_schema is off");
            return Ok(());
        }
        let client = self.client().await?;
        client.batch_execute(&self.sql.ddl).await?;
        info!("Target schema {} is ready", self.sql.schema);
        Ok(())
    }

    async fn begin_session(&self, mode: WriteMode) -> Result<Box<dyn TargetSession>> {
        let pinned = match mode {
            WriteMode::Commit => None,
            WriteMode::DryRun => {
                let client = self.client().await?;
                client.batch_execute("BEGIN").await?;
                if self.create_schema {
                    client.batch_execute(&self.sql.ddl).await?;
                }
                Some(Mutex::new(client))
            }
        };
        Ok(Box::new(PgSession {
            pool: self.pool.clone(),
            sql: self.sql.clone(),
            operation_timeout: self.operation_timeout,
            pinned,
        }))
    }

    async fn existing_identities(&self) -> Result<Vec<ExistingIdentity>> {
        let client = self.client().await?;
        if !self.tables_exist(&client).await? {
            return Ok(Vec::new());
        }
        let rows = client.query(&self.sql.identities, &[]).await?;
        rows.iter()
            .map(|row| {
                let roles: Vec<String> = row.try_get(6)?;
                Ok(ExistingIdentity {
                    id: row.try_get(0)?,
                    first_name: row.try_get(1)?,
                    middle_name: row.try_get(2)?,
                    last_name: row.try_get(3)?,
                    email: row.try_get(4)?,
                    phone: row.try_get(5)?,
                    roles: roles.iter().filter_map(|r| Role::parse(r)).collect(),
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn lookup(&self) -> &dyn TargetLookup {
        self
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

#[async_trait]
impl TargetLookup for PgTarget {
    async fn user_exists(&self, id: TargetId) -> Result<bool> {
        let client = self.client().await?;
        exists(&client, &self.sql.user_exists, id).await
    }

    async fn school_exists(&self, id: TargetId) -> Result<bool> {
        let client = self.client().await?;
        exists(&client, &self.sql.school_exists, id).await
    }

    async fn duplicate_emails(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        strings(&client, &self.sql.duplicate_emails).await
    }

    async fn orphaned_references(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        strings(&client, &self.sql.orphans).await
    }

    async fn row_counts(&self) -> Result<RowCounts> {
        let client = self.client().await?;
        if !self.tables_exist(&client).await? {
            return Ok(RowCounts::default());
        }
        counts(&client, &self.sql).await
    }

    async fn school_summaries(&self, school_ids: &[TargetId]) -> Result<Vec<SchoolSummary>> {
        let client = self.client().await?;
        if !self.tables_exist(&client).await? {
            return Ok(Vec::new());
        }
        summaries(&client, &self.sql, school_ids).await
    }
}

struct PgSession {
    pool: Pool,
    sql: Arc<Sql>,
    /// Deadline for the statements of one batch, `COMMIT` excluded.
    operation_timeout: Duration,
    /// Connection holding the outer dry-run transaction.
    pinned: Option<Mutex<Object>>,
}

/// A connection borrowed either from the pin or from the pool.
enum Conn<'a> {
    Pinned(MutexGuard<'a, Object>),
    Pooled(Object),
}

impl std::ops::Deref for Conn<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        match self {
            Conn::Pinned(guard) => guard,
            Conn::Pooled(object) => object,
        }
    }
}

impl PgSession {
    async fn conn(&self) -> Result<Conn<'_>> {
        match &self.pinned {
            Some(pinned) => Ok(Conn::Pinned(pinned.lock().await)),
            None => Ok(Conn::Pooled(get_client(&self.pool).await?)),
        }
    }
}

#[async_trait]
impl TargetSession for PgSession {
    async fn write_batch(&self, batch: &WriteBatch) -> Result<BatchOutcome> {
        let client = self.conn().await?;
        let (open, commit, rollback) = match &client {
            Conn::Pinned(_) => (
                format!("SAVEPOINT {}", SAVEPOINT),
                format!("RELEASE SAVEPOINT {}", SAVEPOINT),
                format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT),
            ),
            Conn::Pooled(_) => ("BEGIN".to_string(), "COMMIT".to_string(), "ROLLBACK".to_string()),
        };

        client.batch_execute(&open).await.map_err(MigrateError::from_target)?;
        let applied = tokio::time::timeout(self.operation_timeout, apply_batch(&client, &self.sql, batch)).await;
        match applied {
            Ok(Ok(outcome)) => {
                if let Err(e) = client.batch_execute(&commit).await {
                    let err = MigrateError::from_target(e);
                    // A broken connection during COMMIT leaves the outcome unknown.
                    return Err(match &client {
                        Conn::Pooled(_) if err.is_transient() => MigrateError::CommitUncertain(
                            format!("{} batch: {}", batch.kind, err),
                        ),
                        _ => err,
                    });
                }
                Ok(outcome)
            }
            Ok(Err(e)) => {
                if let Err(rb) = client.batch_execute(&rollback).await {
                    warn!("Rollback of {} batch failed: {}", batch.kind, rb);
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    "{} batch exceeded {:?}; abandoning its transaction",
                    batch.kind, self.operation_timeout
                );
                match client {
                    // A statement may still be running. Closing the connection
                    // makes the server roll the batch back and keeps the
                    // half-open transaction out of the pool.
                    Conn::Pooled(object) => drop(Object::take(object)),
                    // The server cancels the statement at statement_timeout,
                    // after which the savepoint can be unwound.
                    Conn::Pinned(guard) => {
                        if let Err(rb) = guard.batch_execute(&rollback).await {
                            warn!("Rollback of {} batch failed: {}", batch.kind, rb);
                        }
                    }
                }
                Err(MigrateError::Connection(format!(
                    "{} batch timed out after {:?}",
                    batch.kind, self.operation_timeout
                )))
            }
        }
    }

    async fn finish(&self) -> Result<()> {
        if let Some(pinned) = &self.pinned {
            pinned.lock().await.batch_execute("ROLLBACK").await?;
            info!("Dry run: all target writes rolled back");
        }
        Ok(())
    }

    fn lookup(&self) -> &dyn TargetLookup {
        self
    }
}

#[async_trait]
impl TargetLookup for PgSession {
    async fn user_exists(&self, id: TargetId) -> Result<bool> {
        let client = self.conn().await?;
        exists(&client, &self.sql.user_exists, id).await
    }

    async fn school_exists(&self, id: TargetId) -> Result<bool> {
        let client = self.conn().await?;
        exists(&client, &self.sql.school_exists, id).await
    }

    async fn duplicate_emails(&self) -> Result<Vec<String>> {
        let client = self.conn().await?;
        strings(&client, &self.sql.duplicate_emails).await
    }

    async fn orphaned_references(&self) -> Result<Vec<String>> {
        let client = self.conn().await?;
        strings(&client, &self.sql.orphans).await
    }

    async fn row_counts(&self) -> Result<RowCounts> {
        let client = self.conn().await?;
        counts(&client, &self.sql).await
    }

    async fn school_summaries(&self, school_ids: &[TargetId]) -> Result<Vec<SchoolSummary>> {
        let client = self.conn().await?;
        summaries(&client, &self.sql, school_ids).await
    }
}

async fn apply_batch(client: &Client, sql: &Sql, batch: &WriteBatch) -> Result<BatchOutcome> {
    let mut scope = BatchScope::default();
    let mut unit_ids = Vec::with_capacity(batch.units.len());
    for unit in &batch.units {
        let id = apply_unit(client, sql, unit, &mut scope)
            .await
            .map_err(|e| attribute(e, &unit.source_id))?;
        unit_ids.push(id);
    }
    Ok(BatchOutcome {
        unit_ids,
        bindings: scope.into_bindings(),
    })
}

async fn apply_unit(client: &Client, sql: &Sql, unit: &WriteUnit, scope: &mut BatchScope) -> Result<TargetId> {
    scope.start_unit();
    for op in &unit.ops {
        match op {
            WriteOp::InsertSchool(school) => {
                let row = client
                    .query_one(
                        &sql.insert_school,
                        &[
                            &school.name,
                            &school.email,
                            &school.phone,
                            &school.code,
                            &school.level,
                            &school.motto,
                            &school.vision,
                            &school.country,
                            &school.county,
                            &school.logo,
                            &school.address,
                            &school.school_type.as_str(),
                            &school.is_active,
                            &school.is_verified,
                        ],
                    )
                    .await
                    .map_err(MigrateError::from_target)?;
                scope.bind_school(row.try_get(0)?);
            }
            WriteOp::InsertUser { key, user } => {
                let school_id = user.school.map(|s| scope.school(s)).transpose()?;
                let row = client
                    .query_one(
                        &sql.insert_user,
                        &[
                            &user.first_name,
                            &user.middle_name,
                            &user.last_name,
                            &user.email,
                            &user.phone,
                            &user.password,
                            &user.password.is_some(),
                            &user.profile_picture,
                            &user.primary_role.as_str(),
                            &user.is_active,
                            &user.is_verified,
                            &school_id,
                            &user.country,
                        ],
                    )
                    .await
                    .map_err(MigrateError::from_target)?;
                scope.bind_user(*key, row.try_get(0)?);
            }
            WriteOp::GrantRole { user, role } => {
                let user_id = scope.user(*user)?;
                client
                    .execute(&sql.grant_role, &[&user_id, &role.as_str()])
                    .await
                    .map_err(MigrateError::from_target)?;
            }
            WriteOp::InsertProfile { user, profile } => {
                let user_id = scope.user(*user)?;
                insert_profile(client, sql, user_id, profile, scope).await?;
            }
        }
    }
    scope.subject(unit.subject)
}

async fn insert_profile(
    client: &Client,
    sql: &Sql,
    user_id: TargetId,
    profile: &Profile,
    scope: &BatchScope,
) -> Result<()> {
    let result = match profile {
        Profile::SchoolAdmin {
            school,
            is_main,
            position,
        } => {
            let school_id = scope.school(*school)?;
            client
                .execute(&sql.insert_school_admin, &[&user_id, &school_id, is_main, position])
                .await
        }
        Profile::Teacher {
            school_id,
            subject_specialization,
            employment_date,
            is_active,
        } => {
            client
                .execute(
                    &sql.insert_teacher,
                    &[&user_id, school_id, subject_specialization, employment_date, is_active],
                )
                .await
        }
        Profile::Parent {
            school_id,
            parent_type,
        } => {
            client
                .execute(&sql.insert_parent, &[&user_id, school_id, &parent_type.as_str()])
                .await
        }
        Profile::Student {
            school_id,
            admission_number,
            gender,
            enrollment_date,
            parent_user_ids,
        } => {
            client
                .execute(
                    &sql.insert_student,
                    &[&user_id, school_id, admission_number, &gender.as_str(), enrollment_date],
                )
                .await
                .map_err(MigrateError::from_target)?;
            for parent_id in parent_user_ids {
                client
                    .execute(&sql.insert_student_parent, &[&user_id, parent_id])
                    .await
                    .map_err(MigrateError::from_target)?;
            }
            return Ok(());
        }
    };
    result.map(|_| ()).map_err(MigrateError::from_target)
}

async fn exists(client: &Client, query: &str, id: TargetId) -> Result<bool> {
    let row = client.query_one(query, &[&id]).await?;
    Ok(row.try_get(0)?)
}

async fn strings(client: &Client, query: &str) -> Result<Vec<String>> {
    let rows = client.query(query, &[]).await?;
    rows.iter()
        .map(|row| row.try_get::<_, String>(0).map_err(MigrateError::from))
        .collect()
}

async fn summaries(client: &Client, sql: &Sql, school_ids: &[TargetId]) -> Result<Vec<SchoolSummary>> {
    let ids = school_ids.to_vec();
    let rows = client.query(&sql.school_summaries, &[&ids]).await?;
    rows.iter()
        .map(|row| {
            let count = |idx: usize| -> Result<u64> { Ok(row.try_get::<_, i64>(idx)?.max(0) as u64) };
            Ok(SchoolSummary {
                school_id: row.try_get(0)?,
                name: row.try_get(1)?,
                teachers: count(2)?,
                parents: count(3)?,
                students: count(4)?,
            })
        })
        .collect()
}

async fn counts(client: &Client, sql: &Sql) -> Result<RowCounts> {
    let row = client.query_one(&sql.row_counts, &[]).await?;
    let get = |idx: usize| -> Result<u64> { Ok(row.try_get::<_, i64>(idx)?.max(0) as u64) };
    Ok(RowCounts {
        schools: get(0)?,
        users: get(1)?,
        user_roles: get(2)?,
        school_admins: get(3)?,
        teachers: get(4)?,
        parents: get(5)?,
        students: get(6)?,
        student_parents: get(7)?,
    })
}
