//! Source-side checks run before any write.

use super::{FindingCode, Severity, ValidationReport};
use crate::error::Result;
use crate::model::{EntityKind, SourceRow};
use crate::retry::{with_retry, RetryConfig};
use crate::source::{SourceFilter, SourceReader};
use std::collections::HashSet;
use tracing::{info, warn};

/// Page through the source and report rows the migration will have to skip,
/// fail, or degrade. Every finding is a WARNING.
///
/// Schools and parents are read in full so that references from filtered
/// rows resolve against everything the source holds. Only rows of `kinds`
/// that match `filter` are checked.
pub async fn preflight(
    source: &dyn SourceReader,
    kinds: &[EntityKind],
    filter: Option<&SourceFilter>,
    batch_size: usize,
    retry: &RetryConfig,
) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut schools = HashSet::new();
    let mut parents = HashSet::new();

    let check_schools = kinds.contains(&EntityKind::Schools);
    for_each_row(source, EntityKind::Schools, batch_size, retry, |row| {
        schools.insert(row.id().to_string());
        if check_schools && matches(filter, row) {
            check_row(row, &schools, &parents, &mut report);
        }
    })
    .await?;
    for_each_row(source, EntityKind::Parents, batch_size, retry, |row| {
        parents.insert(row.id().to_string());
    })
    .await?;

    for kind in [EntityKind::Teachers, EntityKind::Parents, EntityKind::Students] {
        if !kinds.contains(&kind) {
            continue;
        }
        for_each_row(source, kind, batch_size, retry, |row| {
            if matches(filter, row) {
                check_row(row, &schools, &parents, &mut report);
            }
        })
        .await?;
    }

    for finding in &report.findings {
        warn!("{}", finding);
    }
    info!(
        "Pre-flight finished: {} warnings over {} schools and {} parents",
        report.warning_count(),
        schools.len(),
        parents.len()
    );
    Ok(report)
}

async fn for_each_row(
    source: &dyn SourceReader,
    kind: EntityKind,
    batch_size: usize,
    retry: &RetryConfig,
    mut visit: impl FnMut(&SourceRow),
) -> Result<()> {
    let mut after: Option<String> = None;
    loop {
        let batch = with_retry(retry, "read source batch", || {
            source.read_batch(kind, None, after.as_deref(), batch_size)
        })
        .await?;
        batch.iter().for_each(&mut visit);
        match batch.last() {
            Some(last) if batch.len() == batch_size => after = Some(last.id().to_string()),
            _ => return Ok(()),
        }
    }
}

fn matches(filter: Option<&SourceFilter>, row: &SourceRow) -> bool {
    filter.map_or(true, |f| f.matches(row))
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn check_row(
    row: &SourceRow,
    schools: &HashSet<String>,
    parents: &HashSet<String>,
    report: &mut ValidationReport,
) {
    let kind = row.kind();
    let mut flag = |message: String| {
        report.push(Severity::Warning, FindingCode::SourceIntegrity, Some(kind), message);
    };

    if let SourceRow::School(school) = row {
        for (field, value) in [
            ("name", Some(school.name.as_str())),
            ("email", school.email.as_deref()),
            ("code", school.code.as_deref()),
        ] {
            if blank(value) {
                flag(format!("school {} has no {}", school.id, field));
            }
        }
        return;
    }

    match row.school_id() {
        None => flag(format!("{} has no school", row.id())),
        Some(id) if !schools.contains(id) => {
            flag(format!("{} belongs to missing or deleted school {}", row.id(), id))
        }
        Some(_) => {}
    }

    if let SourceRow::Student(student) = row {
        if let Some(parent) = student.parent_id.as_deref() {
            if !parents.contains(parent) {
                flag(format!(
                    "{} references missing or deleted parent {}",
                    student.id, parent
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceParent, SourceSchool, SourceStudent, SourceTeacher};
    use crate::source::MemorySource;

    fn school(id: &str, email: Option<&str>, code: Option<&str>) -> SourceRow {
        SourceRow::School(SourceSchool {
            id: id.into(),
            name: format!("School {}", id),
            email: email.map(Into::into),
            code: code.map(Into::into),
            ..Default::default()
        })
    }

    fn teacher(id: &str, school: Option<&str>) -> SourceRow {
        SourceRow::Teacher(SourceTeacher {
            id: id.into(),
            first_name: "Ann".into(),
            school_id: school.map(Into::into),
            ..Default::default()
        })
    }

    fn parent(id: &str, school: &str) -> SourceRow {
        SourceRow::Parent(SourceParent {
            id: id.into(),
            first_name: "Pat".into(),
            school_id: Some(school.into()),
            ..Default::default()
        })
    }

    fn student(id: &str, school: &str, parent: Option<&str>) -> SourceRow {
        SourceRow::Student(SourceStudent {
            id: id.into(),
            first_name: "Sam".into(),
            school_id: Some(school.into()),
            parent_id: parent.map(Into::into),
            ..Default::default()
        })
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            operation_timeout: None,
        }
    }

    async fn check(source: &MemorySource, filter: Option<&SourceFilter>) -> ValidationReport {
        preflight(source, &EntityKind::ALL, filter, 2, &retry()).await.unwrap()
    }

    #[tokio::test]
    async fn test_clean_source_has_no_findings() {
        let source = MemorySource::with_rows([
            school("S1", Some("a@s1.ke"), Some("001")),
            teacher("T1", Some("S1")),
            parent("P1", "S1"),
            student("ST1", "S1", Some("P1")),
            student("ST2", "S1", None),
        ]);
        let report = check(&source, None).await;
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[tokio::test]
    async fn test_incomplete_school() {
        let source = MemorySource::with_rows([school("S1", None, Some(" "))]);
        let report = check(&source, None).await;
        let messages: Vec<_> = report.findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, vec!["school S1 has no email", "school S1 has no code"]);
        assert!(!report.has_critical());
        assert_eq!(report.findings[0].code, FindingCode::SourceIntegrity);
    }

    #[tokio::test]
    async fn test_dangling_school_and_parent_references() {
        let source = MemorySource::with_rows([
            school("S1", Some("a@s1.ke"), Some("001")),
            teacher("T1", None),
            teacher("T2", Some("S9")),
            student("ST1", "S1", Some("P9")),
        ]);
        let report = check(&source, None).await;
        assert_eq!(report.warning_count(), 3);
        assert_eq!(report.findings[0].stage, Some(EntityKind::Teachers));
        assert!(report.findings[0].message.contains("T1 has no school"));
        assert!(report.findings[1].message.contains("missing or deleted school S9"));
        assert_eq!(report.findings[2].stage, Some(EntityKind::Students));
        assert!(report.findings[2].message.contains("parent P9"));
    }

    #[tokio::test]
    async fn test_filter_limits_checked_rows_not_references() {
        let source = MemorySource::with_rows([
            school("S1", Some("a@s1.ke"), Some("001")),
            school("S2", None, None),
            parent("P2", "S2"),
            teacher("T2", Some("S9")),
            student("ST1", "S1", Some("P2")),
        ]);
        let filter = SourceFilter::parse("school_id=S1").unwrap();
        let report = check(&source, Some(&filter)).await;
        assert!(report.findings.is_empty(), "{:?}", report.findings);
    }

    #[tokio::test]
    async fn test_unselected_kinds_are_not_checked() {
        let source = MemorySource::with_rows([
            school("S1", Some("a@s1.ke"), Some("001")),
            teacher("T1", None),
        ]);
        let report = preflight(&source, &[EntityKind::Schools], None, 2, &retry())
            .await
            .unwrap();
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_transient_read_failures_are_retried() {
        let source = MemorySource::with_rows([school("S1", None, Some("001"))]);
        source.fail_next_reads(1);
        let report = check(&source, None).await;
        assert_eq!(report.warning_count(), 1);
    }
}
