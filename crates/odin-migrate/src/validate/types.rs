//! Validation report types.

use crate::model::EntityKind;
use crate::target::SchoolSummary;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => f.write_str("CRITICAL"),
            Severity::Warning => f.write_str("WARNING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCode {
    /// A mapped row, profile, or parent link points at a missing row.
    OrphanReference,
    /// Stage counters or mapping sizes do not add up.
    CountMismatch,
    /// Two users share a normalized email.
    DuplicateEmail,
    /// Data-quality warning carried over from a stage.
    StageWarning,
    /// A migrated school is missing teachers, students, or parents.
    SchoolConsistency,
    /// A source row the migration will skip or degrade.
    SourceIntegrity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: FindingCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<EntityKind>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", self.severity, stage, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Outcome of an integrity validation pass. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
    /// Number of target references checked by point lookup.
    pub references_checked: u64,
    /// Profile counts of every school the run migrated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub school_summaries: Vec<SchoolSummary>,
}

impl ValidationReport {
    pub fn push(&mut self, severity: Severity, code: FindingCode, stage: Option<EntityKind>, message: String) {
        self.findings.push(Finding {
            severity,
            code,
            stage,
            message,
        });
    }

    pub fn critical_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.findings.len() - self.critical_count()
    }

    pub fn has_critical(&self) -> bool {
        self.critical_count() > 0
    }
}
