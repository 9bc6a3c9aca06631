// Seams L8 depends on but does not implement: reading raw change events
// from a source, and persisting the opaque cursor (§4.8, §6). Concrete
// implementations live in the catalog layer, outside this crate.

use async_trait::async_trait;

use crate::error::Result;

use super::types::{CdcCursor, ChangeEvent, RelationshipId};

#[async_trait]
pub trait CdcSource: Send + Sync {
    /// Reads up to `max_events` change events strictly after `cursor`,
    /// returning each event paired with the cursor value to persist once
    /// that event (and everything before it) has been durably applied.
    async fn read_since(&self, cursor: &CdcCursor, max_events: usize) -> Result<Vec<(ChangeEvent, CdcCursor)>>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, relationship: &RelationshipId) -> Result<CdcCursor>;
    async fn save(&self, relationship: &RelationshipId, cursor: &CdcCursor) -> Result<()>;
}
