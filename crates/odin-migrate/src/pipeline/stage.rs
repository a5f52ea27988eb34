//! Stage capability table and run planning.

use crate::error::{MigrateError, Result};
use crate::model::{EntityKind, Role};
use crate::state::MigrationRun;

/// What one stage does. All stages run through the same runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: EntityKind,
    pub source_table: &'static str,
    /// Every row resolves to a canonical user, and the mapping points at it.
    /// Schools map to the school row; their admin user is resolved when drafted.
    pub requires_identity: bool,
    /// Role granted to users created by this stage.
    pub role: Role,
    /// Stages whose mapping this stage reads.
    pub depends_on: &'static [EntityKind],
}

/// All stages in execution order.
pub const STAGES: [StageSpec; 4] = [
    StageSpec {
        kind: EntityKind::Schools,
        source_table: "School",
        requires_identity: false,
        role: Role::SchoolAdmin,
        depends_on: &[],
    },
    StageSpec {
        kind: EntityKind::Teachers,
        source_table: "Teacher",
        requires_identity: true,
        role: Role::Teacher,
        depends_on: &[EntityKind::Schools],
    },
    StageSpec {
        kind: EntityKind::Parents,
        source_table: "Parent",
        requires_identity: true,
        role: Role::Parent,
        depends_on: &[EntityKind::Schools],
    },
    StageSpec {
        kind: EntityKind::Students,
        source_table: "Student",
        requires_identity: true,
        role: Role::Student,
        depends_on: &[EntityKind::Schools, EntityKind::Parents],
    },
];

pub fn spec(kind: EntityKind) -> &'static StageSpec {
    match kind {
        EntityKind::Schools => &STAGES[0],
        EntityKind::Teachers => &STAGES[1],
        EntityKind::Parents => &STAGES[2],
        EntityKind::Students => &STAGES[3],
    }
}

/// Stages to run for `selected`, in execution order.
///
/// Fails before any write when a selected stage depends on a stage that is
/// neither selected nor already completed in `run`.
pub fn plan(selected: &[EntityKind], run: &MigrationRun) -> Result<Vec<&'static StageSpec>> {
    let mut planned = Vec::new();
    for stage in STAGES.iter().filter(|s| selected.contains(&s.kind)) {
        for dep in stage.depends_on {
            if !selected.contains(dep) && !run.is_stage_completed(*dep) {
                return Err(MigrateError::OrderingViolation(format!(
                    "{} requires {} to be selected or already completed",
                    stage.kind, dep
                )));
            }
        }
        planned.push(stage);
    }
    Ok(planned)
}

/// Runtime guard: every dependency of `stage` must have completed.
pub fn check_ready(stage: &StageSpec, run: &MigrationRun) -> Result<()> {
    match stage.depends_on.iter().find(|dep| !run.is_stage_completed(**dep)) {
        Some(dep) => Err(MigrateError::OrderingViolation(format!(
            "{} cannot start: {} has not completed",
            stage.kind, dep
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;

    #[test]
    fn test_stage_table_matches_kinds() {
        for kind in EntityKind::ALL {
            assert_eq!(spec(kind).kind, kind);
            assert_eq!(spec(kind).source_table, kind.source_table());
        }
    }

    #[test]
    fn test_plan_keeps_fixed_order() {
        let run = MigrationRun::new("h".into(), false);
        let planned = plan(&EntityKind::ALL, &run).unwrap();
        let kinds: Vec<_> = planned.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, EntityKind::ALL.to_vec());
    }

    #[test]
    fn test_plan_rejects_missing_dependency() {
        let run = MigrationRun::new("h".into(), false);
        let err = plan(&[EntityKind::Students], &run).unwrap_err();
        assert!(matches!(err, MigrateError::OrderingViolation(_)));
    }

    #[test]
    fn test_plan_accepts_completed_dependency() {
        let mut run = MigrationRun::new("h".into(), false);
        run.stage_mut(EntityKind::Schools).status = TaskStatus::Completed;
        run.stage_mut(EntityKind::Parents).status = TaskStatus::Completed;
        assert_eq!(plan(&[EntityKind::Students], &run).unwrap().len(), 1);
        assert!(check_ready(spec(EntityKind::Students), &run).is_ok());
        assert!(check_ready(spec(EntityKind::Teachers), &MigrationRun::new("h".into(), false)).is_err());
    }
}
