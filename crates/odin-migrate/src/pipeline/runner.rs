//! Generic stage runner: read, transform, resolve, write, map.

use super::stage::{check_ready, StageSpec};
use crate::config::DefaultsConfig;
use crate::error::{MigrateError, Result};
use crate::identity::{IdentityResolver, Outcome, Resolution};
use crate::model::{
    EntityKind, NewUser, Profile, SourceRow, Subject, TargetId, WriteBatch, WriteOp, WriteUnit,
};
use crate::retry::{with_retry, RetryConfig};
use crate::source::{SourceFilter, SourceReader};
use crate::state::{MigrationRun, ParentLink, TaskStatus};
use crate::target::TargetSession;
use crate::transform::{transform, TargetRow, TransformContext};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Settings shared by every stage of a run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub batch_size: usize,
    pub fail_fast: bool,
    pub strict_parents: bool,
    pub max_failure_ratio: Option<f64>,
    pub max_recorded_errors: usize,
    pub retry: RetryConfig,
    pub filter: Option<SourceFilter>,
    pub defaults: DefaultsConfig,
    pub migration_date: NaiveDate,
    /// Where to persist the run after each committed batch. `None` in dry runs.
    pub state_file: Option<PathBuf>,
}

/// How a stage ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEnd {
    Completed,
    Cancelled,
    /// Fail-fast or the failure-ratio threshold stopped the run.
    Aborted(String),
}

/// Rows of one batch that made it into the write.
struct PlannedUnit {
    source_id: String,
    parent_ids: Vec<TargetId>,
    warnings: Vec<String>,
}

/// Drives one stage at a time against a shared run, resolver, and session.
pub struct StageRunner<'a> {
    pub source: &'a dyn SourceReader,
    pub session: &'a dyn TargetSession,
    pub resolver: &'a mut IdentityResolver,
    pub run: &'a mut MigrationRun,
    pub options: &'a RunnerOptions,
    pub cancel: &'a CancellationToken,
}

impl StageRunner<'_> {
    /// Run `spec` to the end of its source rows.
    pub async fn run_stage(&mut self, spec: &StageSpec) -> Result<StageEnd> {
        let span = info_span!("stage", stage = %spec.kind);
        self.run_stage_inner(spec).instrument(span).await
    }

    async fn run_stage_inner(&mut self, spec: &StageSpec) -> Result<StageEnd> {
        check_ready(spec, self.run)?;
        let kind = spec.kind;
        self.run.current_stage = Some(kind);
        self.run.stage_mut(kind).mark_in_progress();

        let source = self.source;
        let options = self.options;
        let filter = options.filter.as_ref();
        let total = with_retry(&options.retry, "count source rows", || source.count(kind, filter)).await?;
        info!("Migrating {} rows from {}", total, spec.source_table);

        let mut after: Option<String> = None;
        let mut batch_no = 0u64;
        let end = loop {
            if self.cancel.is_cancelled() {
                break StageEnd::Cancelled;
            }

            let limit = options.batch_size;
            let rows = with_retry(&options.retry, "read source batch", || {
                source.read_batch(kind, filter, after.as_deref(), limit)
            })
            .await?;
            let Some(last) = rows.last() else {
                break StageEnd::Completed;
            };
            after = Some(last.id().to_string());
            batch_no += 1;

            let started = Instant::now();
            let span = info_span!("batch", number = batch_no, rows = rows.len());
            let end = self.process_batch(spec, rows).instrument(span).await?;
            debug!("{} batch {} took {:?}", kind, batch_no, started.elapsed());

            if let Some(end) = end {
                break end;
            }
            if let Some(end) = self.check_failure_ratio(kind) {
                break end;
            }
            self.save_state()?;
        };

        let status = match &end {
            StageEnd::Completed => TaskStatus::Completed,
            StageEnd::Cancelled => TaskStatus::Cancelled,
            StageEnd::Aborted(_) => TaskStatus::Failed,
        };
        self.run.stage_mut(kind).finish(status);
        self.log_summary(kind);
        self.save_state()?;
        Ok(end)
    }

    /// Process one batch. Returns `Some` when the stage must stop.
    async fn process_batch(&mut self, spec: &StageSpec, rows: Vec<SourceRow>) -> Result<Option<StageEnd>> {
        let kind = spec.kind;
        let cap = self.options.max_recorded_errors;

        let checkpoint = self.resolver.checkpoint();
        let mut seen = HashSet::new();
        let mut units = Vec::new();
        let mut planned = Vec::new();

        for row in &rows {
            let source_id = row.id();
            self.run.stage_mut(kind).rows_read += 1;
            if self.run.id_mapping.contains(kind, source_id) {
                debug!("{} {} already migrated; skipping", kind, source_id);
                self.run.stage_mut(kind).rows_skipped += 1;
                continue;
            }
            let result = if seen.insert(source_id.to_string()) {
                let row_checkpoint = self.resolver.checkpoint();
                let result = self.build_unit(spec, row);
                if result.is_err() {
                    self.resolver.rollback_to(row_checkpoint);
                }
                result
            } else {
                Err(MigrateError::transform(source_id, "source id appears more than once"))
            };

            match result {
                Ok((unit, plan)) => {
                    units.push(unit);
                    planned.push(plan);
                }
                Err(e) => {
                    error!(
                        source_table = spec.source_table,
                        source_id, "Row failed: {}", e
                    );
                    let stage = self.run.stage_mut(kind);
                    stage.rows_failed += 1;
                    stage.record_error(source_id, &e.to_string(), cap);
                    if self.options.fail_fast {
                        // Rows after this one stay unread; rows before it are never written.
                        self.resolver.rollback_to(checkpoint);
                        self.run.stage_mut(kind).rows_failed += units.len() as u64;
                        return Ok(Some(StageEnd::Aborted(format!(
                            "fail-fast: {} {} failed: {}",
                            kind, source_id, e
                        ))));
                    }
                }
            }
        }

        if units.is_empty() {
            self.resolver.commit();
            return Ok(None);
        }

        let batch = WriteBatch { kind, units };
        let session = self.session;
        // Sessions bound their own writes; cutting one off mid-transaction is unsafe.
        let retry = self.options.retry.without_timeout();
        let written = with_retry(&retry, "write target batch", || {
            session.write_batch(&batch)
        })
        .await;

        match written {
            Ok(outcome) => {
                for (key, id) in &outcome.bindings {
                    self.resolver.bind(*key, *id);
                    if let Some(requested) = self.resolver.disambiguated_request(*key) {
                        self.run.requested_emails.insert(*id, requested.to_string());
                    }
                }
                self.resolver.commit();
                for (plan, target_id) in planned.into_iter().zip(outcome.unit_ids) {
                    self.run.id_mapping.insert(kind, &plan.source_id, target_id)?;
                    self.run
                        .parent_links
                        .extend(plan.parent_ids.iter().map(|&parent_user_id| ParentLink {
                            student_user_id: target_id,
                            parent_user_id,
                        }));
                    let stage = self.run.stage_mut(kind);
                    stage.rows_written += 1;
                    for warning in plan.warnings {
                        warn!(source_table = spec.source_table, source_id = %plan.source_id, "{}", warning);
                        stage.record_warning(warning, cap);
                    }
                }
                Ok(None)
            }
            Err(e @ MigrateError::CommitUncertain(_)) => {
                // The rows may already be in the target. Recording them as failed
                // would invite a duplicate write on resume, so stop the run.
                self.resolver.rollback_to(checkpoint);
                error!(
                    source_table = spec.source_table,
                    "Batch of {} rows in unknown state ({}): {}",
                    batch.units.len(),
                    batch.source_ids().join(", "),
                    e
                );
                Err(e)
            }
            Err(e) => {
                self.resolver.rollback_to(checkpoint);
                let ids = batch.source_ids();
                error!(
                    source_table = spec.source_table,
                    "Batch of {} rows rolled back ({}): {}",
                    ids.len(),
                    ids.join(", "),
                    e
                );
                let message = e.to_string();
                let stage = self.run.stage_mut(kind);
                stage.rows_failed += ids.len() as u64;
                for id in &ids {
                    stage.record_error(id, &message, cap);
                }
                if self.options.fail_fast {
                    return Ok(Some(StageEnd::Aborted(format!(
                        "fail-fast: {} batch failed: {}",
                        kind, message
                    ))));
                }
                Ok(None)
            }
        }
    }

    /// Transform a row and resolve its user into a write unit.
    fn build_unit(&mut self, spec: &StageSpec, row: &SourceRow) -> Result<(WriteUnit, PlannedUnit)> {
        let source_id = row.id();
        let ctx = TransformContext {
            mapping: &self.run.id_mapping,
            defaults: &self.options.defaults,
            migration_date: self.options.migration_date,
            strict_parents: self.options.strict_parents,
        };
        let transformed = transform(row, &ctx)?;

        let mut ops = Vec::new();
        let mut resolved: Option<Resolution> = None;
        let mut parent_ids = Vec::new();
        let mut warnings: Vec<String> = transformed.warnings.clone();

        for target_row in transformed.rows {
            match target_row {
                TargetRow::School(school) => ops.push(WriteOp::InsertSchool(school)),
                TargetRow::User(draft) => {
                    let resolution = self.resolver.resolve(&draft.candidate)?;
                    warnings.extend(
                        resolution
                            .warnings
                            .iter()
                            .map(|w| format!("{} {}: {}", spec.kind, source_id, w)),
                    );
                    if resolution.outcome == Outcome::Created {
                        ops.push(WriteOp::InsertUser {
                            key: resolution.key,
                            user: NewUser {
                                first_name: draft.candidate.first_name,
                                middle_name: draft.candidate.middle_name,
                                last_name: draft.candidate.last_name,
                                email: resolution.email.clone(),
                                phone: resolution.phone.clone(),
                                password: draft.password,
                                profile_picture: draft.profile_picture,
                                primary_role: draft.candidate.role,
                                is_active: draft.is_active,
                                is_verified: draft.is_verified,
                                school: draft.school,
                                country: draft.country,
                            },
                        });
                    } else {
                        debug!(
                            "{} {} merged into existing user {}",
                            spec.kind, source_id, resolution.email
                        );
                    }
                    ops.push(WriteOp::GrantRole {
                        user: resolution.user,
                        role: draft.candidate.role,
                    });
                    resolved = Some(resolution);
                }
                TargetRow::Profile(profile) => {
                    let user = resolved.as_ref().map(|r| r.user).ok_or_else(|| {
                        MigrateError::transform(source_id, "profile without a user")
                    })?;
                    if let Profile::Student { parent_user_ids, .. } = &profile {
                        parent_ids.extend(parent_user_ids.iter().copied());
                    }
                    ops.push(WriteOp::InsertProfile { user, profile });
                }
            }
        }

        let subject = if spec.requires_identity {
            let user = resolved.as_ref().map(|r| r.user).ok_or_else(|| {
                MigrateError::transform(source_id, "row produced no user")
            })?;
            Subject::User(user)
        } else {
            Subject::School
        };

        Ok((
            WriteUnit {
                source_id: source_id.to_string(),
                subject,
                ops,
            },
            PlannedUnit {
                source_id: source_id.to_string(),
                parent_ids,
                warnings,
            },
        ))
    }

    fn check_failure_ratio(&self, kind: EntityKind) -> Option<StageEnd> {
        let max = self.options.max_failure_ratio?;
        let stage = self.run.stage(kind)?;
        if stage.rows_read == 0 {
            return None;
        }
        let ratio = stage.rows_failed as f64 / stage.rows_read as f64;
        if ratio > max {
            Some(StageEnd::Aborted(format!(
                "{} failure ratio {:.3} exceeds {:.3}",
                kind, ratio, max
            )))
        } else {
            None
        }
    }

    fn save_state(&mut self) -> Result<()> {
        if let Some(path) = &self.options.state_file {
            self.run.save(path)?;
        }
        Ok(())
    }

    fn log_summary(&self, kind: EntityKind) {
        let Some(stage) = self.run.stage(kind) else {
            return;
        };
        info!(
            stage = %kind,
            status = ?stage.status,
            read = stage.rows_read,
            written = stage.rows_written,
            skipped = stage.rows_skipped,
            failed = stage.rows_failed,
            warnings = stage.warning_count,
            duration_ms = stage.duration_ms,
            "Stage summary"
        );
        for err in &stage.errors {
            info!(stage = %kind, source_id = %err.source_id, "First errors: {}", err.message);
        }
    }
}
