//! Shard configuration.

use canopy_cohort::CohortTimeouts;

/// Tunables for one shard's commit machinery.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Name of this shard; also the reference point for the
    /// preceding-shard ordering rule.
    pub shard_name: String,

    /// Idle ticks after which the transaction at the head of the queue
    /// is considered expired.
    pub transaction_commit_timeout_ticks: u64,

    /// Per-phase round-trip timeouts for external cohorts.
    pub cohort_timeouts: CohortTimeouts,

    /// Responses retained per transaction for idempotent replay.
    pub replay_window: usize,
}

impl ShardConfig {
    pub fn named(shard_name: impl Into<String>) -> Self {
        Self {
            shard_name: shard_name.into(),
            ..Self::default()
        }
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_name: "default".to_string(),
            // 30 seconds at one tick per nanosecond.
            transaction_commit_timeout_ticks: 30_000_000_000,
            cohort_timeouts: CohortTimeouts::default(),
            replay_window: 64,
        }
    }
}
