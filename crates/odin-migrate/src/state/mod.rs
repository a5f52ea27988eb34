//! Persisted migration run: per-stage counts and the ID mapping, for resume.

use crate::error::{self, MigrateError, Result};
use crate::mapping::IdMapping;
use crate::model::{EntityKind, TargetId};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Process-wide state of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    pub dry_run: bool,

    /// Stage being processed, if any.
    pub current_stage: Option<EntityKind>,

    pub stages: BTreeMap<EntityKind, StageState>,

    pub id_mapping: IdMapping,

    /// Student-to-parent links written in this run, as target user IDs.
    #[serde(default)]
    pub parent_links: Vec<ParentLink>,

    /// Email each migrated user originally asked for, when it differs from
    /// the one assigned. Resume seeds the identity index from it so later
    /// stages still merge into disambiguated users.
    #[serde(default)]
    pub requested_emails: BTreeMap<TargetId, String>,

    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized run (without this field), keyed by
    /// `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished, but with row failures or critical validation findings.
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Process exit code for a finished run.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Completed => error::EXIT_SUCCESS,
            RunStatus::Partial => error::EXIT_RUN_PARTIAL,
            RunStatus::Cancelled => error::EXIT_CANCELLED,
            RunStatus::Running | RunStatus::Failed => error::EXIT_RUN_FAILED,
        }
    }
}

/// Stage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    /// Every batch was processed. Row failures may still have occurred.
    Completed,
    Failed,
    Cancelled,
}

/// A row that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub source_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub student_user_id: TargetId,
    pub parent_user_id: TargetId,
}

/// Per-stage counts and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: TaskStatus,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub rows_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// First errors of the stage, capped at `max_recorded_errors`.
    pub errors: Vec<RowError>,
    /// First warnings of the stage, capped like `errors`.
    pub warnings: Vec<String>,
    pub warning_count: u64,
}

impl StageState {
    pub fn mark_in_progress(&mut self) {
        *self = StageState {
            status: TaskStatus::InProgress,
            started_at: Some(Utc::now()),
            ..StageState::default()
        };
    }

    pub fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    pub fn record_error(&mut self, source_id: &str, message: &str, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(RowError {
                source_id: source_id.to_string(),
                message: message.to_string(),
            });
        }
    }

    pub fn record_warning(&mut self, warning: String, cap: usize) {
        self.warning_count += 1;
        if self.warnings.len() < cap {
            self.warnings.push(warning);
        }
    }

    /// `read == written + skipped + failed`.
    pub fn is_reconciled(&self) -> bool {
        self.rows_read == self.rows_written + self.rows_skipped + self.rows_failed
    }
}

impl MigrationRun {
    /// Create a new run.
    pub fn new(config_hash: String, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            dry_run,
            current_stage: None,
            stages: BTreeMap::new(),
            id_mapping: IdMapping::new(),
            parent_links: Vec::new(),
            requested_emails: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a run from a state file, rejecting files whose signature does not match.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let run: Self = serde_json::from_str(&content)?;

        let Some(stored) = &run.hmac else {
            return Err(MigrateError::State("state file is not signed".into()));
        };
        if stored != &run.compute_hmac()? {
            return Err(MigrateError::State(
                "state file integrity check failed: HMAC mismatch (possible tampering)".into(),
            ));
        }
        Ok(run)
    }

    /// Save to a state file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    pub fn stage(&self, kind: EntityKind) -> Option<&StageState> {
        self.stages.get(&kind)
    }

    pub fn stage_mut(&mut self, kind: EntityKind) -> &mut StageState {
        self.stages.entry(kind).or_default()
    }

    pub fn is_stage_completed(&self, kind: EntityKind) -> bool {
        self.stage(kind)
            .map(|s| s.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    pub fn total_failed(&self) -> u64 {
        self.stages.values().map(|s| s.rows_failed).sum()
    }

    /// Record the terminal status.
    pub fn mark_finished(&mut self, status: RunStatus) {
        self.status = status;
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample() -> MigrationRun {
        let mut run = MigrationRun::new("abc123".into(), false);
        run.id_mapping.insert(EntityKind::Schools, "S1", 1).unwrap();
        let stage = run.stage_mut(EntityKind::Schools);
        stage.mark_in_progress();
        stage.rows_read = 2;
        stage.rows_written = 1;
        stage.rows_failed = 1;
        stage.record_error("S2", "boom", 10);
        stage.finish(TaskStatus::Completed);
        run
    }

    #[test]
    fn test_state_save_load() {
        let mut run = sample();
        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let loaded = MigrationRun::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.config_hash, "abc123");
        assert_eq!(loaded.id_mapping.get(EntityKind::Schools, "S1"), Some(1));
        assert!(loaded.is_stage_completed(EntityKind::Schools));
        assert!(!loaded.is_stage_completed(EntityKind::Teachers));
        assert_eq!(loaded.stage(EntityKind::Schools).unwrap().errors.len(), 1);
    }

    #[test]
    fn test_state_file_is_pretty_json() {
        let mut run = sample();
        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&content).is_ok());
        assert!(content.contains("\n  \"run_id\""));
        assert!(content.contains("\"schools\""));
    }

    #[test]
    fn test_tampered_state_rejected() {
        let mut run = sample();
        let file = NamedTempFile::new().unwrap();
        run.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        std::fs::write(file.path(), content.replace("\"rows_written\": 1", "\"rows_written\": 2")).unwrap();
        let err = MigrationRun::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
    }

    #[test]
    fn test_unsigned_state_rejected() {
        let run = sample();
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&run).unwrap()).unwrap();
        assert!(MigrationRun::load(file.path()).is_err());
    }

    #[test]
    fn test_config_validation() {
        let run = MigrationRun::new("abc123".into(), false);
        assert!(run.validate_config("abc123").is_ok());
        assert!(matches!(
            run.validate_config("different"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_stage_counters() {
        let mut stage = StageState::default();
        stage.mark_in_progress();
        stage.rows_read = 5;
        stage.rows_written = 3;
        stage.rows_skipped = 1;
        assert!(!stage.is_reconciled());
        stage.rows_failed = 1;
        assert!(stage.is_reconciled());

        for i in 0..5 {
            stage.record_warning(format!("w{}", i), 2);
        }
        assert_eq!(stage.warnings.len(), 2);
        assert_eq!(stage.warning_count, 5);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 2);
        assert_eq!(RunStatus::Partial.exit_code(), 3);
        assert_eq!(RunStatus::Cancelled.exit_code(), 5);
    }
}
