//! Engine configuration.
//!
//! All tunables of the core live here as one plain struct with sensible
//! defaults. Tests shrink the windows to milliseconds; production deployments
//! deserialize the seconds-based knobs from their config source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum wait for HA switch completion, in seconds.
pub const SWITCH_MAX_WAIT_SECONDS: u64 = 600;

/// Bounded polling parameters for workflow and cluster-status loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// Maximum number of status probes before giving up.
    pub max_retry: u32,
    /// Interval between probes, in milliseconds.
    pub interval_ms: u64,
}

impl PollConfig {
    /// Returns the probe interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_retry: 60,
            interval_ms: 10_000,
        }
    }
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Development-only: skip APPROVAL and HUMAN-CONFIRM stages.
    ///
    /// Never enable outside development environments.
    pub dev_skip_approval_confirm: bool,
    /// How long to wait for a cancelled external workflow to terminate
    /// before marking the flow with `SYSTEM_TERMINATED_ERROR`, in seconds.
    pub cancel_window_secs: u64,
    /// Interval between cancellation status probes, in milliseconds.
    pub cancel_poll_interval_ms: u64,
    /// Maximum automatic re-runs of an AUTO-ON-TRANSIENT flow.
    pub max_auto_retries: u32,
    /// Backoff before an automatic retry, in milliseconds.
    pub auto_retry_backoff_ms: u64,
    /// Maximum wait for HA switch completion in the alarm watcher, in seconds.
    pub switch_max_wait_secs: u64,
    /// Polling parameters for drill workflow-tree and cluster-status loops.
    pub drill_poll: PollConfig,
    /// Minimum cluster age before the backup audit considers it, in hours.
    pub backup_audit_min_age_hours: u32,
    /// Look-back window for backup records, in hours.
    pub backup_lookback_hours: u32,
    /// Maximum acceptable FULL backup duration, in hours.
    pub backup_max_full_duration_hours: u32,
    /// Minimum length of the contiguous incremental-backup chain.
    pub backup_min_incremental_chain: u32,
    /// Look-back window for the rollback exercise's backup gate, in hours.
    pub exercise_backup_lookback_hours: u32,
}

impl EngineConfig {
    /// Returns the cancellation window as a [`Duration`].
    #[must_use]
    pub const fn cancel_window(&self) -> Duration {
        Duration::from_secs(self.cancel_window_secs)
    }

    /// Returns the cancellation probe interval as a [`Duration`].
    #[must_use]
    pub const fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    /// Returns the automatic-retry backoff as a [`Duration`].
    #[must_use]
    pub const fn auto_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.auto_retry_backoff_ms)
    }

    /// Returns the switch-watcher wait bound as a [`Duration`].
    #[must_use]
    pub const fn switch_max_wait(&self) -> Duration {
        Duration::from_secs(self.switch_max_wait_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dev_skip_approval_confirm: false,
            cancel_window_secs: 60,
            cancel_poll_interval_ms: 2_000,
            max_auto_retries: 3,
            auto_retry_backoff_ms: 5_000,
            switch_max_wait_secs: SWITCH_MAX_WAIT_SECONDS,
            drill_poll: PollConfig::default(),
            backup_audit_min_age_hours: 24,
            backup_lookback_hours: 24,
            backup_max_full_duration_hours: 8,
            backup_min_incremental_chain: 12,
            exercise_backup_lookback_hours: 48,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_safe() {
        let config = EngineConfig::default();
        assert!(!config.dev_skip_approval_confirm);
        assert_eq!(config.switch_max_wait_secs, SWITCH_MAX_WAIT_SECONDS);
        assert_eq!(config.backup_max_full_duration_hours, 8);
        assert_eq!(config.backup_min_incremental_chain, 12);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cancelWindowSecs": 5}"#).unwrap();
        assert_eq!(config.cancel_window_secs, 5);
        assert_eq!(config.max_auto_retries, 3);
    }
}
