// Stream Manager (L5, §4.5). See `manager` for the full contract.

pub mod manager;
pub mod types;

pub use manager::{InboxSource, OutboxSink, StreamManager, StreamOp};
pub use types::{CommittedSeq, Envelope, QosClass, Stream, StreamId};
