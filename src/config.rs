// Explicit, enumerated configuration for the mesh runtime.
//
// Per the redesign notes (ad-hoc reflection-based configuration must be
// replaced), every tunable the runtime honors is a named field here rather
// than a dynamically-keyed map. Loading from a file rejects unknown keys
// instead of ignoring them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{MeshError, Result};
use crate::stream::QosClass;

/// Partition-resolution policy, selected at mesh-creation time (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    MajorityWins,
    SeedNodePrevails,
    Manual,
}

impl Default for SplitStrategy {
    fn default() -> Self {
        SplitStrategy::MajorityWins
    }
}

/// Per-QoS-class routing cost weights (§4.3 path cost formula).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosWeights {
    pub w_lat: f64,
    pub w_loss: f64,
    pub w_util: f64,
}

impl QosWeights {
    fn critical() -> Self {
        Self { w_lat: 1.0, w_loss: 4.0, w_util: 0.5 }
    }
    fn high() -> Self {
        Self { w_lat: 1.2, w_loss: 2.0, w_util: 0.8 }
    }
    fn normal() -> Self {
        Self { w_lat: 1.0, w_loss: 1.0, w_util: 1.0 }
    }
    fn low() -> Self {
        Self { w_lat: 0.6, w_loss: 0.5, w_util: 2.0 }
    }
}

/// The full set of runtime options, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    // Transport endpoints
    pub bind_addr: String,
    pub advertise_addr: String,

    // Raft timing (MCG and, where not overridden, DSG)
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_ms: u64,
    pub snapshot_threshold: usize,
    pub learner_catchup_ms: u64,

    // Delivery tuning
    pub outbox_high_watermark: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_permanent_attempts: u32,
    pub inbox_retention_window: u64,

    // Link layer
    pub ping_interval_ms: u64,
    pub missed_ping_threshold: u32,
    pub credit_window_bytes: usize,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,

    // Topology & routing
    pub ewma_alpha: f64,
    pub lsa_delta_threshold: f64,
    pub probe_interval_ms: u64,
    pub qos_weights: HashMap<QosClass, QosWeights>,

    // Partition handling
    pub split_strategy: SplitStrategy,
    pub seed_node: Option<String>,

    // Graceful shutdown
    pub grace_period_ms: u64,

    // Sequence lease batch size granted by MCG to a stream leader
    pub sequence_lease_batch: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let mut qos_weights = HashMap::new();
        qos_weights.insert(QosClass::Critical, QosWeights::critical());
        qos_weights.insert(QosClass::High, QosWeights::high());
        qos_weights.insert(QosClass::Normal, QosWeights::normal());
        qos_weights.insert(QosClass::Low, QosWeights::low());

        Self {
            bind_addr: "0.0.0.0:7600".to_string(),
            advertise_addr: "127.0.0.1:7600".to_string(),

            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_ms: 50,
            snapshot_threshold: 10_000,
            learner_catchup_ms: 1_000,

            outbox_high_watermark: 10_000,
            backoff_base_ms: 200,
            backoff_cap_ms: 30_000,
            max_permanent_attempts: 5,
            inbox_retention_window: 10_000,

            ping_interval_ms: 10_000,
            missed_ping_threshold: 3,
            credit_window_bytes: 1 << 20,
            reconnect_backoff_base_ms: 500,
            reconnect_backoff_cap_ms: 60_000,

            ewma_alpha: 0.2,
            lsa_delta_threshold: 0.15,
            probe_interval_ms: 5_000,
            qos_weights,

            split_strategy: SplitStrategy::MajorityWins,
            seed_node: None,

            grace_period_ms: 30_000,
            sequence_lease_batch: 100,
        }
    }
}

impl MeshConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn qos_weights_for(&self, class: QosClass) -> QosWeights {
        self.qos_weights.get(&class).copied().unwrap_or_else(QosWeights::normal)
    }

    /// Parse from a JSON config document, rejecting unknown keys outright
    /// rather than silently ignoring them (§9 redesign note). Configuration
    /// is otherwise expected to be built programmatically from
    /// `MeshConfig::default()` plus explicit field overrides.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| MeshError::Configuration(format!("invalid or unknown key: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.backoff_base_ms, 200);
        assert_eq!(cfg.backoff_cap_ms, 30_000);
        assert_eq!(cfg.ping_interval_ms, 10_000);
        assert_eq!(cfg.missed_ping_threshold, 3);
    }

    #[test]
    fn rejects_unknown_keys() {
        let bad = r#"{"bind_addr": "x", "not_a_real_field": 1}"#;
        assert!(MeshConfig::from_json_str(bad).is_err());
    }
}
