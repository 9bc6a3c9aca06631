// Delivery Engine (L6, §4.6). See `engine` for the full contract; `types`
// holds the outbox/inbox/delivery-log row shapes and the wire payloads DATA
// and ACK frames carry.

pub mod engine;
pub mod inbox;
pub mod outbox;
pub mod types;

pub use engine::{logical_stream_id, DeliveryConfig, DeliveryEngine};
pub use types::{AckResult, DeliveryLogEntry, DeliveryState, InboxEntry, OutboxEntry, OutboxStatus};
