// reDB mesh runtime: a multi-tenant control-plane mesh connecting federated
// database nodes. L1 identity/keystore, L2 authenticated link layer, L3
// LSA-gossiped topology/routing, L4 Mesh Control Group consensus, L5 stream
// manager, L6 delivery engine, L7 optional per-tenant Data State Groups, L8
// CDC relationship runtime, L9 the narrow in-process service surface plus
// `ops`'s introspection/control RPC. The catalog database itself — schema,
// CRUD, end-user auth — lives outside this crate; `catalog_adapter` is the
// trait seam this crate calls into it through.

pub mod catalog_adapter;
pub mod cdc;
pub mod config;
pub mod consensus;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod link;
pub mod membership;
pub mod ops;
pub mod runtime;
pub mod service;
pub mod stream;
pub mod topology;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use runtime::Runtime;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
