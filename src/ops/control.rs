// The control-plane seam `ops`'s mutating endpoints call through. `Runtime`
// is the only implementer — it owns every worker a `drain`/`rotate-key`/
// `force-snapshot` command needs to reach (§5, §6).

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Stops accepting new work and waits up to `grace_ms` for in-flight
    /// sends/applies to finish before returning (§3 Open Question 2's
    /// `Shutdown { grace }` mailbox pattern, exposed here as an operator
    /// command rather than a process-exit trigger).
    async fn drain(&self, grace_ms: u64) -> Result<()>;

    /// Rotates this node's signing key and begins propagating the new
    /// public key through the MCG (§4.1).
    async fn rotate_key(&self) -> Result<()>;

    /// Forces an immediate Raft snapshot for `group_id`, ahead of the
    /// configured size threshold (§4.4).
    async fn force_snapshot(&self, group_id: &str) -> Result<()>;
}
