// CDC Relationship Runtime (L8, §4.8). See `runtime` for the orchestration,
// `types` for the event/relationship model, `source`/`applier` for the
// external seams, `mapping` for transform evaluation and dead-lettering.

pub mod applier;
pub mod mapping;
pub mod runtime;
pub mod source;
pub mod stream_bridge;
pub mod types;

pub use applier::{group_by_commit_bracket, TargetApplier};
pub use mapping::{apply_mapping, DeadLetterSink, IdentityMapper, NullDeadLetterSink, RowMapper};
pub use runtime::CdcRuntime;
pub use source::{CdcSource, CursorStore};
pub use stream_bridge::{StreamApplierWorker, StreamEmitter};
pub use types::{CdcCursor, CdcMechanism, ChangeEvent, ChangeType, Relationship, RelationshipId, RelationshipState, TransformError};
