// Mapping/transformation evaluation with dead-lettering (§4.8). The actual
// transform rules (column renames, type coercion, lookups) are supplied by
// the catalog layer; this crate only runs them and routes the two failure
// modes the spec distinguishes.

use async_trait::async_trait;

use super::types::{ChangeEvent, TransformError};

/// A single relationship's transform. Implementations are supplied by the
/// catalog layer (the rule definitions live there); this crate only invokes
/// the seam.
pub trait RowMapper: Send + Sync {
    fn map(&self, event: &ChangeEvent) -> Result<Option<ChangeEvent>, TransformError>;
}

/// Transform that passes every event through unchanged. Used when a
/// relationship has no column mapping configured.
pub struct IdentityMapper;

impl RowMapper for IdentityMapper {
    fn map(&self, event: &ChangeEvent) -> Result<Option<ChangeEvent>, TransformError> {
        Ok(Some(event.clone()))
    }
}

/// Where dead-lettered events (unresolved mappings) go, per relationship.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, relationship: &str, event: ChangeEvent, reason: String);
}

/// Dead-letter sink that only counts and logs; tests and single-process
/// demos use this, a catalog-backed implementation ships in the adapter.
#[derive(Default)]
pub struct NullDeadLetterSink;

#[async_trait]
impl DeadLetterSink for NullDeadLetterSink {
    async fn dead_letter(&self, relationship: &str, event: ChangeEvent, reason: String) {
        tracing::warn!(relationship, lsn = %event.lsn, table = %event.table, reason, "CDC event dead-lettered");
    }
}

/// Runs `mapper` against `event`: `Ok(Some(_))` to forward, `Ok(None)` to
/// silently drop (filtered out by the mapping, not an error), `Err` to
/// dead-letter (`Unresolved`) or degrade the relationship (`Fatal`).
pub fn apply_mapping(mapper: &dyn RowMapper, event: ChangeEvent) -> Result<Option<ChangeEvent>, TransformError> {
    mapper.map(&event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::types::ChangeType;

    fn sample_event() -> ChangeEvent {
        ChangeEvent { lsn: "1".into(), table: "accounts".into(), op: ChangeType::Insert, primary_key: vec![], before: None, after: None, commit_ts: 0 }
    }

    #[test]
    fn identity_mapper_passes_event_through() {
        let mapped = apply_mapping(&IdentityMapper, sample_event()).unwrap();
        assert!(mapped.is_some());
    }
}
