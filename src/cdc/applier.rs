// Target applier: commit-bracket grouping and idempotent per-row apply
// (§4.8). The apply itself is an external seam (the catalog layer knows how
// to write the target table); this module only knows how to group.

use async_trait::async_trait;

use crate::error::Result;

use super::types::ChangeEvent;

#[async_trait]
pub trait TargetApplier: Send + Sync {
    /// Applies one commit bracket — every event sharing a `commit_ts` — to
    /// `target_table` as a single unit. Must be idempotent per
    /// `ChangeEvent::message_id()` so a re-applied bracket after a restart
    /// is a no-op rather than a double-write.
    async fn apply_batch(&self, target_table: &str, events: &[ChangeEvent]) -> Result<()>;
}

/// Splits a batch of events (assumed already in source order) into
/// commit-ts-contiguous brackets, so a multi-row transaction on the source
/// lands atomically on the target rather than row-by-row (§4.8).
pub fn group_by_commit_bracket(events: Vec<ChangeEvent>) -> Vec<Vec<ChangeEvent>> {
    let mut brackets: Vec<Vec<ChangeEvent>> = Vec::new();
    for event in events {
        match brackets.last_mut() {
            Some(bracket) if bracket.last().map(|e| e.commit_ts) == Some(event.commit_ts) => bracket.push(event),
            _ => brackets.push(vec![event]),
        }
    }
    brackets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::types::ChangeType;

    fn event(ts: i64) -> ChangeEvent {
        ChangeEvent { lsn: ts.to_string(), table: "t".into(), op: ChangeType::Insert, primary_key: vec![], before: None, after: None, commit_ts: ts }
    }

    #[test]
    fn groups_contiguous_same_timestamp_events() {
        let events = vec![event(1), event(1), event(2), event(2), event(2), event(3)];
        let brackets = group_by_commit_bracket(events);
        let sizes: Vec<usize> = brackets.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 3, 1]);
    }

    #[test]
    fn empty_input_yields_no_brackets() {
        assert!(group_by_commit_bracket(vec![]).is_empty());
    }
}
