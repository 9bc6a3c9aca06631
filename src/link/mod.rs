// Link Layer (L2): authenticated, framed, multiplexed duplex channels
// between this node and its peers. `frame`/`codec` define the wire shape,
// `handshake` authenticates a freshly-dialed or freshly-accepted socket,
// `connection` runs one established link, and `manager` owns the set of
// links (dial, reconnect-with-backoff, keep-alive) as the single
// link-manager worker named in §5.

pub mod codec;
pub mod connection;
pub mod flow_control;
pub mod frame;
pub mod handshake;
pub mod manager;

pub use connection::{InboundFrame, Link, LinkState};
pub use frame::FrameType;
pub use manager::{LinkEvent, LinkManager};
