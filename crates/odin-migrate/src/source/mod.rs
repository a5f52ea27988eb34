//! Heimdall (V1) source readers.

mod memory;
mod postgres;

pub use memory::MemorySource;
pub use postgres::PgSource;
pub(crate) use postgres::quote_ident;

use crate::error::{MigrateError, Result};
use crate::model::{EntityKind, SourceRow};
use async_trait::async_trait;
use std::fmt;

/// Trait for reading source rows.
///
/// Rows are returned in ascending source-ID order so callers can page with
/// the last ID of the previous batch.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Read up to `limit` rows of `kind` with an ID strictly greater than `after`.
    async fn read_batch(
        &self,
        kind: EntityKind,
        filter: Option<&SourceFilter>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRow>>;

    /// Count rows of `kind` matching `filter`.
    async fn count(&self, kind: EntityKind, filter: Option<&SourceFilter>) -> Result<u64>;

    /// Check that the source is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Get the source type.
    fn db_type(&self) -> &str;
}

/// Row predicate parsed from `--filter`.
///
/// Terms are comma-separated `field=value` pairs over `id` and `school_id`.
/// Terms on the same field are alternatives; terms on different fields must
/// all hold. A school's `school_id` is its own ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    pub ids: Vec<String>,
    pub school_ids: Vec<String>,
}

impl SourceFilter {
    pub fn parse(s: &str) -> Result<Self> {
        let mut filter = SourceFilter::default();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (field, value) = term.split_once('=').ok_or_else(|| {
                MigrateError::Config(format!("filter term '{}' is not field=value", term))
            })?;
            let value = value.trim();
            if value.is_empty() {
                return Err(MigrateError::Config(format!(
                    "filter term '{}' has an empty value",
                    term
                )));
            }
            match field.trim() {
                "id" => filter.ids.push(value.to_string()),
                "school_id" => filter.school_ids.push(value.to_string()),
                other => {
                    return Err(MigrateError::Config(format!(
                        "unknown filter field '{}' (expected id or school_id)",
                        other
                    )))
                }
            }
        }
        if filter.is_empty() {
            return Err(MigrateError::Config("filter has no terms".into()));
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.school_ids.is_empty()
    }

    pub fn matches(&self, row: &SourceRow) -> bool {
        let id_ok = self.ids.is_empty() || self.ids.iter().any(|id| id == row.id());
        let school_ok = self.school_ids.is_empty()
            || row
                .school_id()
                .is_some_and(|sid| self.school_ids.iter().any(|s| s == sid));
        id_ok && school_ok
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .ids
            .iter()
            .map(|v| format!("id={}", v))
            .chain(self.school_ids.iter().map(|v| format!("school_id={}", v)))
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceSchool, SourceTeacher};

    fn teacher(id: &str, school: &str) -> SourceRow {
        SourceRow::Teacher(SourceTeacher {
            id: id.into(),
            first_name: "T".into(),
            school_id: Some(school.into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_filter() {
        let f = SourceFilter::parse("school_id=S1, school_id=S2,id=T9").unwrap();
        assert_eq!(f.school_ids, vec!["S1", "S2"]);
        assert_eq!(f.ids, vec!["T9"]);
        assert_eq!(f.to_string(), "id=T9,school_id=S1,school_id=S2");
    }

    #[test]
    fn test_parse_filter_errors() {
        assert!(SourceFilter::parse("").is_err());
        assert!(SourceFilter::parse("school_id").is_err());
        assert!(SourceFilter::parse("school_id=").is_err());
        assert!(SourceFilter::parse("county=Nairobi").is_err());
    }

    #[test]
    fn test_filter_matches() {
        let f = SourceFilter::parse("school_id=S1").unwrap();
        assert!(f.matches(&teacher("T1", "S1")));
        assert!(!f.matches(&teacher("T2", "S2")));

        let school = SourceRow::School(SourceSchool {
            id: "S1".into(),
            name: "A".into(),
            ..Default::default()
        });
        assert!(f.matches(&school));

        let both = SourceFilter::parse("school_id=S1,id=T2").unwrap();
        assert!(!both.matches(&teacher("T1", "S1")));
    }
}
