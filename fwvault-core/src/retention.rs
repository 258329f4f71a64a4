/*!
Retention policies and the sweep planner.
*/

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::DeviceId;
use crate::metadata::SnapshotId;
use crate::{Result, VaultError};

/// Bounds on how many and how old snapshots are kept for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: Some(30),
            max_age_days: None,
        }
    }
}

impl RetentionPolicy {
    pub fn keep_all() -> Self {
        Self {
            max_count: None,
            max_age_days: None,
        }
    }

    pub fn max_count(count: usize) -> Self {
        Self {
            max_count: Some(count),
            max_age_days: None,
        }
    }

    pub fn with_max_age_days(mut self, days: u32) -> Self {
        self.max_age_days = Some(days);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_count == Some(0) {
            return Err(VaultError::config(
                "retention max_count must be at least 1",
            ));
        }
        if self.max_age_days == Some(0) {
            return Err(VaultError::config(
                "retention max_age_days must be at least 1",
            ));
        }
        Ok(())
    }

    /// Choose which entries to remove
    ///
    /// `entries` must be ordered oldest first. Expired entries go first,
    /// then the oldest unpinned entries until `max_count` is met. Pinned
    /// entries and the newest snapshot are never returned.
    pub fn plan<T: SweepCandidate>(&self, entries: &[T], now: DateTime<Utc>) -> Vec<usize> {
        let mut doomed = vec![false; entries.len()];
        let newest = entries.len().saturating_sub(1);

        if let Some(days) = self.max_age_days {
            let cutoff = now - Duration::days(i64::from(days));
            for (idx, entry) in entries.iter().enumerate() {
                if idx != newest && !entry.is_pinned() && entry.captured_at() < cutoff {
                    doomed[idx] = true;
                }
            }
        }

        if let Some(max) = self.max_count {
            let mut remaining = doomed.iter().filter(|d| !**d).count();
            for (idx, entry) in entries.iter().enumerate() {
                if remaining <= max {
                    break;
                }
                if idx != newest && !doomed[idx] && !entry.is_pinned() {
                    doomed[idx] = true;
                    remaining -= 1;
                }
            }
        }

        doomed
            .iter()
            .enumerate()
            .filter_map(|(idx, d)| d.then_some(idx))
            .collect()
    }
}

/// What the planner needs to know about a stored snapshot
pub trait SweepCandidate {
    fn captured_at(&self) -> DateTime<Utc>;
    fn is_pinned(&self) -> bool;
}

/// Policies per device and group with a global fallback
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub default: RetentionPolicy,
    pub groups: BTreeMap<String, RetentionPolicy>,
    pub devices: BTreeMap<String, RetentionPolicy>,
}

impl RetentionConfig {
    /// Resolution order: device, then group, then default
    pub fn policy_for(&self, device_id: &DeviceId, group: Option<&str>) -> RetentionPolicy {
        self.devices
            .get(device_id.as_str())
            .or_else(|| group.and_then(|g| self.groups.get(g)))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for policy in self.groups.values().chain(self.devices.values()) {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Summary of one device sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub device_id: Option<DeviceId>,
    pub removed: Vec<SnapshotId>,
    /// Snapshots remaining after the sweep
    pub kept: usize,
    /// Pinned snapshots the policy would otherwise have removed
    pub pinned: usize,
    /// Stored bytes released by removing unreferenced blobs
    pub bytes_freed: u64,
}
