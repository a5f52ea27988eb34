//! PostgreSQL reader over the Heimdall schema.
//!
//! Heimdall tables use quoted camelCase columns and soft deletes; only rows
//! with `"isDeleted" = false` are visible. IDs are compared as text so the
//! paging order matches the in-memory reader regardless of the key type.

use super::{SourceFilter, SourceReader};
use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::model::{EntityKind, SourceParent, SourceRow, SourceSchool, SourceStudent, SourceTeacher};
use crate::tls::connect_pool;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use std::time::Duration;
use tokio_postgres::Row;
use tracing::debug;

const SCHOOL_COLUMNS: &str = r#"id::text, COALESCE("schoolName", '')::text, email::text, phone::text,
    "schoolCode"::text, "schoolLevel"::text, "schoolMotto"::text, "schoolVision"::text,
    country::text, county::text, logo::text, "schoolAddress"::text, type::text, password::text,
    COALESCE("isActive", true), COALESCE("isVerified", false)"#;

const TEACHER_COLUMNS: &str = r#"id::text, COALESCE("firstName", '')::text, "middleName"::text,
    "lastName"::text, email::text, "phoneNumber"::text, "profileImage"::text, password::text,
    "schoolId"::text, COALESCE("isLoginBarred", false), subjects::text"#;

const PARENT_COLUMNS: &str = r#"id::text, COALESCE("firstName", '')::text, "middleName"::text,
    "lastName"::text, email::text, "phoneNumber"::text, "secondaryPhoneNumber"::text,
    relationship::text, "profileImage"::text, password::text, "schoolId"::text,
    COALESCE("isLoginBarred", false)"#;

const STUDENT_COLUMNS: &str = r#"id::text, COALESCE("firstName", '')::text, "middleName"::text,
    "lastName"::text, "studentAdmissionNumber"::text, gender::text, "profileImage"::text,
    "schoolId"::text, "parentId"::text"#;

/// PostgreSQL source reader.
pub struct PgSource {
    pool: Pool,
    schema: String,
}

impl PgSource {
    /// Connect to the Heimdall database.
    pub async fn connect(config: &DatabaseConfig, operation_timeout: Duration) -> Result<Self> {
        let pool = connect_pool(config, "source", operation_timeout).await?;
        Ok(Self::from_pool(pool, &config.schema))
    }

    pub fn from_pool(pool: Pool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    fn table(&self, kind: EntityKind) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(kind.source_table()))
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting source connection"))
    }
}

/// `WHERE` clause for `kind` and `filter`, with parameters starting at `$first`.
fn where_clause(kind: EntityKind, filter: Option<&SourceFilter>, first: usize) -> (String, Vec<Vec<String>>) {
    let mut conditions = vec![r#""isDeleted" = false"#.to_string()];
    let mut params = Vec::new();
    if let Some(filter) = filter {
        if !filter.ids.is_empty() {
            conditions.push(format!("id::text = ANY(${})", first + params.len()));
            params.push(filter.ids.clone());
        }
        if !filter.school_ids.is_empty() {
            let column = match kind {
                EntityKind::Schools => "id",
                _ => r#""schoolId""#,
            };
            conditions.push(format!("{}::text = ANY(${})", column, first + params.len()));
            params.push(filter.school_ids.clone());
        }
    }
    (conditions.join(" AND "), params)
}

fn columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Schools => SCHOOL_COLUMNS,
        EntityKind::Teachers => TEACHER_COLUMNS,
        EntityKind::Parents => PARENT_COLUMNS,
        EntityKind::Students => STUDENT_COLUMNS,
    }
}

#[async_trait]
impl SourceReader for PgSource {
    async fn read_batch(
        &self,
        kind: EntityKind,
        filter: Option<&SourceFilter>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let (clause, filter_params) = where_clause(kind, filter, 3);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} AND id::text > $1 ORDER BY id::text LIMIT $2",
            columns(kind),
            self.table(kind),
            clause
        );
        let after = after.unwrap_or("").to_string();
        let limit = limit as i64;
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(2 + filter_params.len());
        params.push(&after);
        params.push(&limit);
        for p in &filter_params {
            params.push(p);
        }

        debug!("{}: reading batch after '{}'", kind, after);
        let client = self.client().await?;
        let rows = client.query(&sql, &params).await.map_err(MigrateError::Source)?;
        rows.iter().map(|row| parse_row(kind, row)).collect()
    }

    async fn count(&self, kind: EntityKind, filter: Option<&SourceFilter>) -> Result<u64> {
        let (clause, filter_params) = where_clause(kind, filter, 1);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table(kind), clause);
        let params: Vec<&(dyn ToSql + Sync)> =
            filter_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let client = self.client().await?;
        let row = client.query_one(&sql, &params).await.map_err(MigrateError::Source)?;
        let count: i64 = row.try_get(0).map_err(MigrateError::Source)?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(MigrateError::Source)?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

fn parse_row(kind: EntityKind, row: &Row) -> Result<SourceRow> {
    let text = |idx: usize| -> Result<Option<String>> { row.try_get(idx).map_err(MigrateError::Source) };
    let required = |idx: usize| -> Result<String> { Ok(text(idx)?.unwrap_or_default()) };
    let flag = |idx: usize| -> Result<bool> { row.try_get(idx).map_err(MigrateError::Source) };

    let parsed = match kind {
        EntityKind::Schools => SourceRow::School(SourceSchool {
            id: required(0)?,
            name: required(1)?,
            email: text(2)?,
            phone: text(3)?,
            code: text(4)?,
            level: text(5)?,
            motto: text(6)?,
            vision: text(7)?,
            country: text(8)?,
            county: text(9)?,
            logo: text(10)?,
            address: text(11)?,
            school_type: text(12)?,
            password: text(13)?,
            is_active: flag(14)?,
            is_verified: flag(15)?,
        }),
        EntityKind::Teachers => SourceRow::Teacher(SourceTeacher {
            id: required(0)?,
            first_name: required(1)?,
            middle_name: text(2)?,
            last_name: text(3)?,
            email: text(4)?,
            phone: text(5)?,
            profile_image: text(6)?,
            password: text(7)?,
            school_id: text(8)?,
            is_login_barred: flag(9)?,
            subjects: text(10)?.map(|s| parse_subjects(&s)).unwrap_or_default(),
        }),
        EntityKind::Parents => SourceRow::Parent(SourceParent {
            id: required(0)?,
            first_name: required(1)?,
            middle_name: text(2)?,
            last_name: text(3)?,
            email: text(4)?,
            phone: text(5)?,
            secondary_phone: text(6)?,
            relationship: text(7)?,
            profile_image: text(8)?,
            password: text(9)?,
            school_id: text(10)?,
            is_login_barred: flag(11)?,
        }),
        EntityKind::Students => SourceRow::Student(SourceStudent {
            id: required(0)?,
            first_name: required(1)?,
            middle_name: text(2)?,
            last_name: text(3)?,
            admission_number: text(4)?,
            gender: text(5)?,
            profile_image: text(6)?,
            school_id: text(7)?,
            parent_id: text(8)?,
        }),
    };
    Ok(parsed)
}

/// Split a `subjects` value that is either a Postgres array literal
/// (`{Maths,"Home Science"}`) or a plain comma-separated string.
fn parse_subjects(raw: &str) -> Vec<String> {
    let inner = raw
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(raw);
    inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
        .collect()
}

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subjects() {
        assert_eq!(
            parse_subjects(r#"{Maths,"Home Science",NULL}"#),
            vec!["Maths", "Home Science"]
        );
        assert_eq!(parse_subjects("English, Kiswahili"), vec!["English", "Kiswahili"]);
        assert!(parse_subjects("{}").is_empty());
    }

    #[test]
    fn test_where_clause_numbers_params() {
        let filter = SourceFilter::parse("id=T1,school_id=S1").unwrap();
        let (clause, params) = where_clause(EntityKind::Teachers, Some(&filter), 3);
        assert_eq!(
            clause,
            r#""isDeleted" = false AND id::text = ANY($3) AND "schoolId"::text = ANY($4)"#
        );
        assert_eq!(params.len(), 2);

        let (clause, _) = where_clause(EntityKind::Schools, Some(&filter), 1);
        assert!(clause.ends_with("id::text = ANY($2)"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("School"), "\"School\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
