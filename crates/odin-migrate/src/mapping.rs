//! Append-only source-ID to target-ID mapping shared across stages.

use crate::error::{MigrateError, Result};
use crate::model::{EntityKind, TargetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `(entity kind, source id) -> target id`.
///
/// For schools the target is the school row; for the person stages it is
/// the canonical user the row resolved to. Entries are never changed once
/// written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdMapping {
    entries: BTreeMap<EntityKind, BTreeMap<String, TargetId>>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, source_id: &str) -> Option<TargetId> {
        self.entries.get(&kind)?.get(source_id).copied()
    }

    pub fn contains(&self, kind: EntityKind, source_id: &str) -> bool {
        self.get(kind, source_id).is_some()
    }

    /// Record a mapping. Writing the same source ID twice is an error.
    pub fn insert(&mut self, kind: EntityKind, source_id: &str, target_id: TargetId) -> Result<()> {
        let entries = self.entries.entry(kind).or_default();
        if entries.contains_key(source_id) {
            return Err(MigrateError::DuplicateMapping {
                kind: kind.to_string(),
                source_id: source_id.to_string(),
            });
        }
        entries.insert(source_id.to_string(), target_id);
        Ok(())
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.entries.get(&kind).map(|e| e.len()).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Entries of one kind, ordered by source ID.
    pub fn iter(&self, kind: EntityKind) -> impl Iterator<Item = (&str, TargetId)> {
        self.entries
            .get(&kind)
            .into_iter()
            .flat_map(|e| e.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Schools, "S1", 10).unwrap();
        mapping.insert(EntityKind::Teachers, "S1", 20).unwrap();
        assert_eq!(mapping.get(EntityKind::Schools, "S1"), Some(10));
        assert_eq!(mapping.get(EntityKind::Teachers, "S1"), Some(20));
        assert_eq!(mapping.get(EntityKind::Parents, "S1"), None);
        assert_eq!(mapping.total(), 2);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Parents, "P1", 1).unwrap();
        let err = mapping.insert(EntityKind::Parents, "P1", 2).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateMapping { .. }));
        assert_eq!(mapping.get(EntityKind::Parents, "P1"), Some(1));
    }

    #[test]
    fn test_json_round_trip_keeps_kinds() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Students, "ST-1", 5).unwrap();
        let json = serde_json::to_string(&mapping).unwrap();
        assert!(json.contains("\"students\""));
        let back: IdMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn test_iter_is_ordered() {
        let mut mapping = IdMapping::new();
        mapping.insert(EntityKind::Teachers, "b", 2).unwrap();
        mapping.insert(EntityKind::Teachers, "a", 1).unwrap();
        let ids: Vec<_> = mapping.iter(EntityKind::Teachers).collect();
        assert_eq!(ids, vec![("a", 1), ("b", 2)]);
    }
}
