//! HA switch-queue watcher.
//!
//! Consumes the HA daemon's monotonically-increasing switch queue and
//! accounts, per faulty host, the expected vs observed switched-port sets,
//! the min/max switch ids seen, and a per-status breakdown. Hosts whose
//! switches are incomplete after the wait bound are marked "ignored, wait
//! timeout".
//!
//! The next-watch cursor is the smallest of {successful max, waiting min,
//! ignored max + 1} — conservative enough that an in-flight switch is
//! re-read on the next watch. "Waiting" here means an incomplete host whose
//! latest observed event is still `doing`; other incomplete hosts are
//! plainly ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::external::SwitchQueueService;

/// Message attached to hosts whose switches never completed.
pub const WAIT_TIMEOUT_MSG: &str = "ignored, wait timeout";

/// Fetch size per queue read.
const FETCH_LIMIT: usize = 512;

/// Per-host switch accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSwitchProgress {
    /// The faulty host.
    pub host: String,
    /// Ports expected to switch.
    pub expected_ports: BTreeSet<u16>,
    /// Ports observed switched (`success` events).
    pub switched_ports: BTreeSet<u16>,
    /// Smallest switch id observed for the host.
    pub min_switch_id: u64,
    /// Largest switch id observed for the host.
    pub max_switch_id: u64,
    /// Event count per daemon status token.
    pub status_counts: BTreeMap<String, u32>,
    /// Latest status token observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

impl HostSwitchProgress {
    fn new(host: String, expected: BTreeSet<u16>) -> Self {
        Self {
            host,
            expected_ports: expected,
            switched_ports: BTreeSet::new(),
            min_switch_id: u64::MAX,
            max_switch_id: 0,
            status_counts: BTreeMap::new(),
            last_status: None,
        }
    }

    /// Returns true when every expected port switched.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.expected_ports.is_empty() && self.switched_ports.is_superset(&self.expected_ports)
    }

    fn observed_any(&self) -> bool {
        self.max_switch_id > 0 || self.min_switch_id != u64::MAX
    }
}

/// Outcome of one watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchReport {
    /// Hosts whose expected ports all switched.
    pub successful: Vec<HostSwitchProgress>,
    /// Incomplete hosts, each with its report message.
    pub ignored: Vec<(HostSwitchProgress, String)>,
    /// Where the next watch should start reading.
    pub next_watch_id: u64,
}

/// Watches the switch queue for a set of faulty hosts.
pub struct SwitchWatcher {
    queue: Arc<dyn SwitchQueueService>,
    max_wait: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for SwitchWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchWatcher")
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl SwitchWatcher {
    /// Creates a watcher.
    #[must_use]
    pub fn new(
        queue: Arc<dyn SwitchQueueService>,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            max_wait,
            poll_interval,
        }
    }

    /// Watches from `start_id` until every expected host completes or the
    /// wait bound elapses.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue service fails.
    #[tracing::instrument(skip(self, expected), fields(start_id, hosts = expected.len()))]
    pub async fn watch(
        &self,
        start_id: u64,
        expected: &BTreeMap<String, BTreeSet<u16>>,
    ) -> Result<WatchReport> {
        let mut progress: BTreeMap<String, HostSwitchProgress> = expected
            .iter()
            .map(|(host, ports)| {
                (
                    host.clone(),
                    HostSwitchProgress::new(host.clone(), ports.clone()),
                )
            })
            .collect();

        let started = tokio::time::Instant::now();
        let mut cursor = start_id;

        loop {
            let events = self.queue.fetch_since(cursor, FETCH_LIMIT).await?;
            for event in &events {
                cursor = cursor.max(event.switch_id + 1);
                let Some(host) = progress.get_mut(&event.host) else {
                    continue;
                };
                host.min_switch_id = host.min_switch_id.min(event.switch_id);
                host.max_switch_id = host.max_switch_id.max(event.switch_id);
                *host.status_counts.entry(event.status.clone()).or_insert(0) += 1;
                host.last_status = Some(event.status.clone());
                if event.status == "success" {
                    host.switched_ports.insert(event.port);
                }
            }

            if progress.values().all(HostSwitchProgress::is_complete) {
                break;
            }
            if started.elapsed() >= self.max_wait {
                tracing::warn!("switch wait bound elapsed");
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let mut successful = Vec::new();
        let mut ignored = Vec::new();
        let mut successful_max: Option<u64> = None;
        let mut waiting_min: Option<u64> = None;
        let mut ignored_max: Option<u64> = None;

        for host in progress.into_values() {
            if host.is_complete() {
                successful_max = Some(successful_max.map_or(host.max_switch_id, |m| {
                    m.max(host.max_switch_id)
                }));
                successful.push(host);
            } else {
                let in_flight = host.last_status.as_deref() == Some("doing");
                if in_flight {
                    waiting_min =
                        Some(waiting_min.map_or(host.min_switch_id, |m| m.min(host.min_switch_id)));
                } else if host.observed_any() {
                    ignored_max = Some(ignored_max.map_or(host.max_switch_id, |m| {
                        m.max(host.max_switch_id)
                    }));
                }
                ignored.push((host, WAIT_TIMEOUT_MSG.to_owned()));
            }
        }

        let next_watch_id = [
            successful_max,
            waiting_min,
            ignored_max.map(|m| m + 1),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(start_id);

        Ok(WatchReport {
            successful,
            ignored,
            next_watch_id,
        })
    }
}
