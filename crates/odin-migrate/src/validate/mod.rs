//! Post-migration integrity validation.
//!
//! The validator never writes. It checks, in order:
//! - stage counters reconcile and the ID mapping covers every written row
//! - every mapped target row and parent link exists (point lookups)
//! - no profile or link row in the target dangles
//! - no two users share an email
//! - every migrated school has teachers, students, and parents for its students
//!
//! Stage warnings are carried into the report as WARNING findings.

mod preflight;
mod types;

pub use preflight::preflight;
pub use types::*;

use crate::error::Result;
use crate::model::EntityKind;
use crate::state::MigrationRun;
use crate::target::TargetLookup;
use tracing::{info, warn};

/// Validate `run` against the target as seen through `lookup`.
pub async fn validate(run: &MigrationRun, lookup: &dyn TargetLookup) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    check_counts(run, &mut report);
    check_mapped_rows(run, lookup, &mut report).await?;
    check_parent_links(run, lookup, &mut report).await?;

    for orphan in lookup.orphaned_references().await? {
        report.push(
            Severity::Critical,
            FindingCode::OrphanReference,
            None,
            format!("target row references a missing row: {}", orphan),
        );
    }

    for email in lookup.duplicate_emails().await? {
        report.push(
            Severity::Critical,
            FindingCode::DuplicateEmail,
            None,
            format!("email {} is held by more than one user", email),
        );
    }

    check_schools(run, lookup, &mut report).await?;
    copy_stage_warnings(run, &mut report);

    for finding in &report.findings {
        match finding.severity {
            Severity::Critical => warn!("{}", finding),
            Severity::Warning => info!("{}", finding),
        }
    }
    info!(
        "Validation finished: {} critical, {} warnings, {} references checked",
        report.critical_count(),
        report.warning_count(),
        report.references_checked
    );
    Ok(report)
}

fn check_counts(run: &MigrationRun, report: &mut ValidationReport) {
    for (kind, stage) in &run.stages {
        if !stage.is_reconciled() {
            report.push(
                Severity::Critical,
                FindingCode::CountMismatch,
                Some(*kind),
                format!(
                    "read {} != written {} + skipped {} + failed {}",
                    stage.rows_read, stage.rows_written, stage.rows_skipped, stage.rows_failed
                ),
            );
        }
        let mapped = run.id_mapping.len(*kind) as u64;
        if mapped < stage.rows_written + stage.rows_skipped {
            report.push(
                Severity::Critical,
                FindingCode::CountMismatch,
                Some(*kind),
                format!(
                    "{} mapping entries for {} written and {} skipped rows",
                    mapped, stage.rows_written, stage.rows_skipped
                ),
            );
        }
    }
}

async fn check_mapped_rows(
    run: &MigrationRun,
    lookup: &dyn TargetLookup,
    report: &mut ValidationReport,
) -> Result<()> {
    for kind in EntityKind::ALL {
        for (source_id, target_id) in run.id_mapping.iter(kind) {
            let exists = match kind {
                EntityKind::Schools => lookup.school_exists(target_id).await?,
                _ => lookup.user_exists(target_id).await?,
            };
            report.references_checked += 1;
            if !exists {
                let what = if kind == EntityKind::Schools { "school" } else { "user" };
                report.push(
                    Severity::Critical,
                    FindingCode::OrphanReference,
                    Some(kind),
                    format!(
                        "source id {} maps to missing {} {}",
                        source_id, what, target_id
                    ),
                );
            }
        }
    }
    Ok(())
}

async fn check_parent_links(
    run: &MigrationRun,
    lookup: &dyn TargetLookup,
    report: &mut ValidationReport,
) -> Result<()> {
    for link in &run.parent_links {
        for (role, id) in [("student", link.student_user_id), ("parent", link.parent_user_id)] {
            report.references_checked += 1;
            if !lookup.user_exists(id).await? {
                report.push(
                    Severity::Critical,
                    FindingCode::OrphanReference,
                    Some(EntityKind::Students),
                    format!(
                        "parent link {} -> {} points at missing {} user {}",
                        link.student_user_id, link.parent_user_id, role, id
                    ),
                );
            }
        }
    }
    Ok(())
}

async fn check_schools(
    run: &MigrationRun,
    lookup: &dyn TargetLookup,
    report: &mut ValidationReport,
) -> Result<()> {
    let ids: Vec<_> = run
        .id_mapping
        .iter(EntityKind::Schools)
        .map(|(_, target_id)| target_id)
        .collect();
    if ids.is_empty() {
        return Ok(());
    }
    let summaries = lookup.school_summaries(&ids).await?;
    for school in &summaries {
        let mut gaps = Vec::new();
        if school.teachers == 0 {
            gaps.push("no teachers");
        }
        if school.students == 0 {
            gaps.push("no students");
        } else if school.parents == 0 {
            gaps.push("students but no parents");
        }
        if !gaps.is_empty() {
            report.push(
                Severity::Warning,
                FindingCode::SchoolConsistency,
                Some(EntityKind::Schools),
                format!("school {} ({}) has {}", school.school_id, school.name, gaps.join(", ")),
            );
        }
    }
    report.school_summaries = summaries;
    Ok(())
}

fn copy_stage_warnings(run: &MigrationRun, report: &mut ValidationReport) {
    for (kind, stage) in &run.stages {
        for warning in &stage.warnings {
            report.push(Severity::Warning, FindingCode::StageWarning, Some(*kind), warning.clone());
        }
        let unrecorded = stage.warning_count.saturating_sub(stage.warnings.len() as u64);
        if unrecorded > 0 {
            report.push(
                Severity::Warning,
                FindingCode::StageWarning,
                Some(*kind),
                format!("{} more warnings not recorded", unrecorded),
            );
        }
    }
}
