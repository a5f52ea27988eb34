//! In-memory source, used by tests and by callers that already hold the rows.

use super::{SourceFilter, SourceReader};
use crate::error::{MigrateError, Result};
use crate::model::{EntityKind, SourceRow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct MemorySource {
    rows: BTreeMap<EntityKind, Vec<SourceRow>>,
    failing_reads: AtomicU32,
    stalled_reads: AtomicU32,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = SourceRow>) -> Self {
        let mut source = Self::new();
        for row in rows {
            source.push(row);
        }
        source
    }

    pub fn push(&mut self, row: SourceRow) {
        let rows = self.rows.entry(row.kind()).or_default();
        rows.push(row);
        rows.sort_by(|a, b| a.id().cmp(b.id()));
    }

    /// Make the next `n` reads fail with a transient connection error.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads hang until the caller gives up on them.
    pub fn stall_next_reads(&self, n: u32) {
        self.stalled_reads.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        take_one(&self.failing_reads)
    }

    fn matching<'a>(
        &'a self,
        kind: EntityKind,
        filter: Option<&'a SourceFilter>,
    ) -> impl Iterator<Item = &'a SourceRow> {
        self.rows
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(move |row| filter.map_or(true, |f| f.matches(row)))
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn read_batch(
        &self,
        kind: EntityKind,
        filter: Option<&SourceFilter>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        if take_one(&self.stalled_reads) {
            std::future::pending::<()>().await;
        }
        if self.take_failure() {
            return Err(MigrateError::Connection("injected source read failure".into()));
        }
        Ok(self
            .matching(kind, filter)
            .filter(|row| after.map_or(true, |after| row.id() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, kind: EntityKind, filter: Option<&SourceFilter>) -> Result<u64> {
        Ok(self.matching(kind, filter).count() as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceParent;

    fn parent(id: &str) -> SourceRow {
        SourceRow::Parent(SourceParent {
            id: id.into(),
            first_name: "P".into(),
            school_id: Some("S1".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_keyset_pagination() {
        let source = MemorySource::with_rows(["c", "a", "b"].map(parent));
        let first = source
            .read_batch(EntityKind::Parents, None, None, 2)
            .await
            .unwrap();
        assert_eq!(first.iter().map(|r| r.id()).collect::<Vec<_>>(), vec!["a", "b"]);
        let rest = source
            .read_batch(EntityKind::Parents, None, Some("b"), 2)
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|r| r.id()).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(source.count(EntityKind::Parents, None).await.unwrap(), 3);
        assert_eq!(source.count(EntityKind::Students, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let source = MemorySource::with_rows([parent("a")]);
        source.fail_next_reads(1);
        let err = source
            .read_batch(EntityKind::Parents, None, None, 10)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            source
                .read_batch(EntityKind::Parents, None, None, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stalled_read_never_returns() {
        let source = MemorySource::with_rows([parent("a")]);
        source.stall_next_reads(1);
        let stalled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            source.read_batch(EntityKind::Parents, None, None, 10),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(
            source
                .read_batch(EntityKind::Parents, None, None, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
