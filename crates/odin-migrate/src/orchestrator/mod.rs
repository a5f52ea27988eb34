//! Migration orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::identity::{IdentityResolver, ResolverPolicy};
use crate::model::EntityKind;
use crate::pipeline::{plan, RunnerOptions, StageEnd, StageRunner};
use crate::source::{PgSource, SourceFilter, SourceReader};
use crate::state::{MigrationRun, RowError, RunStatus, TaskStatus};
use crate::target::{PgTarget, RowCounts, TargetSession, TargetWriter, WriteMode};
use crate::validate::{preflight, validate, ValidationReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    state_file: Option<PathBuf>,
    state: Option<MigrationRun>,
    dry_run: bool,
    validate: bool,
    preflight: bool,
}

/// Per-stage part of a [`MigrationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: EntityKind,
    pub status: TaskStatus,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub rows_failed: u64,
    pub warnings: u64,
    pub duration_ms: u64,
    /// First row errors of the stage.
    pub errors: Vec<RowError>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// Whether every write was rolled back.
    pub dry_run: bool,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Stages in execution order, including ones completed by an earlier run.
    pub stages: Vec<StageSummary>,

    /// Why the run was stopped early (fail-fast or failure ratio).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,

    /// Target row counts before the run.
    pub rows_before: RowCounts,

    /// Target row counts at the end of the run, as seen by the run's session.
    pub rows_after: RowCounts,

    /// Present when validation was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,

    /// Source checks made before the first stage, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<ValidationReport>,
}

/// Connectivity of both databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Orchestrator {
    /// Create a new orchestrator connected to the Heimdall source and Odin target.
    pub async fn new(config: Config) -> Result<Self> {
        let timeout = config.migration.operation_timeout();
        let source = PgSource::connect(&config.source, timeout).await?;
        let target =
            PgTarget::connect(&config.target, config.migration.create_target_schema, timeout).await?;
        Ok(Self::with_endpoints(config, Arc::new(source), Arc::new(target)))
    }

    /// Create an orchestrator over already-built endpoints.
    pub fn with_endpoints(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            state_file: None,
            state: None,
            dry_run: false,
            validate: false,
            preflight: false,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Roll back every write and never touch the state file.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run the integrity validator at the end of the run.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Check the source for rows that will be skipped or degraded before
    /// writing anything. Findings are advisory.
    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    /// Load existing state for resume, if the state file exists.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationRun::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    /// Run the migration.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started = Instant::now();
        let mut run = match self.state.take() {
            Some(mut run) => {
                run.status = RunStatus::Running;
                run.completed_at = None;
                run.dry_run = self.dry_run;
                run
            }
            None => MigrationRun::new(self.config.hash(), self.dry_run),
        };
        info!(
            "Starting migration run {}{}",
            run.run_id,
            if self.dry_run { " (dry run)" } else { "" }
        );

        let filter = self
            .config
            .migration
            .filter
            .as_deref()
            .map(SourceFilter::parse)
            .transpose()?;
        if let Some(ref f) = filter {
            info!("Source filter: {}", f);
        }
        let stages = plan(&self.config.migration.selected_entities(), &run)?;
        info!(
            "Stages: {}",
            stages
                .iter()
                .map(|s| s.kind.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let source_report = if self.preflight {
            let kinds: Vec<_> = stages.iter().map(|s| s.kind).collect();
            Some(
                preflight(
                    self.source.as_ref(),
                    &kinds,
                    filter.as_ref(),
                    self.config.migration.batch_size,
                    &self.config.migration.retry_config(),
                )
                .await?,
            )
        } else {
            None
        };

        if !self.dry_run {
            self.target.prepare_schema().await?;
        }
        let rows_before = self.target.lookup().row_counts().await?;

        let mut resolver = IdentityResolver::new(ResolverPolicy::from_config(&self.config));
        let existing = self.target.existing_identities().await?;
        resolver.seed(&existing, &run.requested_emails);
        info!("Seeded identity index with {} existing users", existing.len());

        let mode = if self.dry_run {
            WriteMode::DryRun
        } else {
            WriteMode::Commit
        };
        let session = self.target.begin_session(mode).await?;

        let options = RunnerOptions {
            batch_size: self.config.migration.batch_size,
            fail_fast: self.config.migration.fail_fast,
            strict_parents: self.config.migration.strict_parents,
            max_failure_ratio: self.config.migration.max_failure_ratio,
            max_recorded_errors: self.config.migration.max_recorded_errors,
            retry: self.config.migration.retry_config(),
            filter,
            defaults: self.config.defaults.clone(),
            migration_date: Utc::now().date_naive(),
            state_file: if self.dry_run {
                None
            } else {
                self.state_file.clone()
            },
        };

        let mut abort_reason = None;
        let mut cancelled = false;
        for spec in stages {
            let mut runner = StageRunner {
                source: self.source.as_ref(),
                session: session.as_ref(),
                resolver: &mut resolver,
                run: &mut run,
                options: &options,
                cancel: &cancel,
            };
            match runner.run_stage(spec).await {
                Ok(StageEnd::Completed) => {}
                Ok(StageEnd::Cancelled) => {
                    warn!("Cancellation requested; stopping after {}", spec.kind);
                    cancelled = true;
                    break;
                }
                Ok(StageEnd::Aborted(reason)) => {
                    error!("Run aborted: {}", reason);
                    abort_reason = Some(reason);
                    break;
                }
                Err(e) => {
                    error!("{} stage failed: {}", spec.kind, e);
                    self.fail_run(&mut run, session.as_ref()).await;
                    return Err(e);
                }
            }
        }

        let validation = if self.validate && abort_reason.is_none() && !cancelled {
            Some(validate(&run, session.lookup()).await?)
        } else {
            None
        };
        let rows_after = session.lookup().row_counts().await?;
        session.finish().await?;

        let status = if abort_reason.is_some() {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else if run.total_failed() > 0 || validation.as_ref().is_some_and(|v| v.has_critical()) {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        run.mark_finished(status);
        self.save_state(&mut run)?;

        let result = MigrationResult {
            run_id: run.run_id.clone(),
            status,
            dry_run: self.dry_run,
            duration_seconds: started.elapsed().as_secs_f64(),
            started_at: run.started_at,
            completed_at: run.completed_at.unwrap_or_else(Utc::now),
            stages: summaries(&run),
            abort_reason,
            rows_before,
            rows_after,
            validation,
            preflight: source_report,
        };
        info!(
            "Migration run {} finished: {} in {:.2}s ({} users resolved)",
            result.run_id,
            status.as_str(),
            result.duration_seconds,
            resolver.user_count()
        );
        Ok(result)
    }

    /// Record a failed run, discard the session, and persist what was committed.
    async fn fail_run(&self, run: &mut MigrationRun, session: &dyn TargetSession) {
        if let Some(kind) = run.current_stage {
            run.stage_mut(kind).finish(TaskStatus::Failed);
        }
        run.mark_finished(RunStatus::Failed);
        if let Err(e) = session.finish().await {
            warn!("Failed to close target session: {}", e);
        }
        if let Err(e) = self.save_state(run) {
            warn!("Failed to save state: {}", e);
        }
    }

    /// Save state to file. Dry runs never persist.
    fn save_state(&self, run: &mut MigrationRun) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        if let Some(ref path) = self.state_file {
            run.save(path)?;
        }
        Ok(())
    }

    /// Validate the run recorded in the state file against the committed target.
    pub async fn validate_only(&self) -> Result<ValidationReport> {
        let path = self.state_file.as_ref().ok_or_else(|| {
            MigrateError::Config("validation needs --state-file pointing at a previous run".into())
        })?;
        let run = MigrationRun::load(path)?;
        run.validate_config(&self.config.hash())?;
        info!("Validating run {} ({})", run.run_id, run.status.as_str());
        validate(&run, self.target.lookup()).await
    }

    /// Test connectivity to the source and target databases.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let source = async {
            let started = Instant::now();
            let result = self.source.health_check().await;
            (result, started.elapsed().as_millis() as u64)
        };
        let target = async {
            let started = Instant::now();
            let result = self.target.health_check().await;
            (result, started.elapsed().as_millis() as u64)
        };
        let ((source_result, source_latency_ms), (target_result, target_latency_ms)) =
            futures::future::join(source, target).await;

        let source_error = source_result.err().map(|e| e.to_string());
        let target_error = target_result.err().map(|e| e.to_string());
        Ok(HealthCheckResult {
            source_connected: source_error.is_none(),
            source_latency_ms,
            target_connected: target_error.is_none(),
            target_latency_ms,
            healthy: source_error.is_none() && target_error.is_none(),
            source_error,
            target_error,
        })
    }
}

fn summaries(run: &MigrationRun) -> Vec<StageSummary> {
    run.stages
        .iter()
        .map(|(kind, stage)| StageSummary {
            stage: *kind,
            status: stage.status,
            rows_read: stage.rows_read,
            rows_written: stage.rows_written,
            rows_skipped: stage.rows_skipped,
            rows_failed: stage.rows_failed,
            warnings: stage.warning_count,
            duration_ms: stage.duration_ms,
            errors: stage.errors.clone(),
        })
        .collect()
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceRow, SourceSchool};
    use crate::source::MemorySource;
    use crate::target::MemoryTarget;

    const CONFIG: &str = r#"
source:
  host: localhost
  database: heimdall
target:
  host: localhost
  database: odin
"#;

    fn school(id: &str, name: &str) -> SourceRow {
        SourceRow::School(SourceSchool {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        })
    }

    fn orchestrator(target: &MemoryTarget) -> Orchestrator {
        let source = MemorySource::with_rows([school("S1", "Greenfield"), school("S2", "Hillside")]);
        Orchestrator::with_endpoints(
            Config::from_yaml(CONFIG).unwrap(),
            Arc::new(source),
            Arc::new(target.clone()),
        )
    }

    #[tokio::test]
    async fn test_run_reports_stage_summaries() {
        let target = MemoryTarget::new();
        let result = orchestrator(&target)
            .with_validation(true)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.stages.len(), 4);
        assert_eq!(result.stages[0].rows_written, 2);
        assert_eq!(result.rows_before.schools, 0);
        assert_eq!(result.rows_after.schools, 2);
        assert!(!result.validation.as_ref().unwrap().has_critical());

        let json = result.to_json().unwrap();
        assert!(json.contains("\"status\": \"completed\""));
    }

    #[tokio::test]
    async fn test_preflight_reports_source_gaps_without_blocking() {
        let target = MemoryTarget::new();
        let result = orchestrator(&target)
            .with_preflight(true)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let report = result.preflight.as_ref().unwrap();
        assert!(!report.has_critical());
        // Neither school has an email or a code.
        assert_eq!(report.warning_count(), 4);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.rows_after.schools, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let target = MemoryTarget::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator(&target).run(cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.exit_code(), 5);
        assert_eq!(target.tables().await.schools.len(), 0);
    }

    #[tokio::test]
    async fn test_health_check_memory_endpoints() {
        let target = MemoryTarget::new();
        let health = orchestrator(&target).health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.source_error.is_none());
    }

    #[tokio::test]
    async fn test_validate_only_needs_state_file() {
        let target = MemoryTarget::new();
        let err = orchestrator(&target).validate_only().await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }
}
