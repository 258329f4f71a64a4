/*!
Diff & version tracking between consecutive snapshots of a device.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::device::{DeviceId, DeviceKind};
use crate::metadata::{SnapshotId, SnapshotMetadata};
use crate::normalize::Normalizer;
use crate::snapshot::ArtifactStore;
use crate::{Result, VaultError};

/// One changed line, numbered in the normalized text it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub line_no: usize,
    pub text: String,
}

/// Structured change summary between two normalized exports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: Vec<DiffLine>,
    pub removed: Vec<DiffLine>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// `+N -M`
    pub fn stat(&self) -> String {
        format!("+{} -{}", self.added.len(), self.removed.len())
    }

    /// Removed lines as `- text`, then added lines as `+ text`
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.removed {
            let _ = writeln!(out, "-{:>6} {}", line.line_no, line.text);
        }
        for line in &self.added {
            let _ = writeln!(out, "+{:>6} {}", line.line_no, line.text);
        }
        out
    }
}

/// Line-oriented comparison of two exports after normalization
pub fn diff_contents(kind: DeviceKind, old: &str, new: &str) -> ChangeSummary {
    let normalizer = Normalizer::for_kind(kind);
    let old = normalizer.normalize(old);
    let new = normalizer.normalize(new);
    if old == new {
        return ChangeSummary::default();
    }

    let diff = TextDiff::from_lines(&old, &new);
    let mut summary = ChangeSummary::default();
    for change in diff.iter_all_changes() {
        let text = change.value().trim_end_matches('\n').to_string();
        match change.tag() {
            ChangeTag::Delete => summary.removed.push(DiffLine {
                line_no: change.old_index().map_or(0, |i| i + 1),
                text,
            }),
            ChangeTag::Insert => summary.added.push(DiffLine {
                line_no: change.new_index().map_or(0, |i| i + 1),
                text,
            }),
            ChangeTag::Equal => {}
        }
    }
    summary
}

/// Comparison of two snapshots of the same device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub device_id: DeviceId,
    /// `None` for the first capture of a device
    pub previous: Option<SnapshotId>,
    pub current: SnapshotId,
    pub change_detected: bool,
    pub summary: ChangeSummary,
    pub created_at: DateTime<Utc>,
}

impl DiffRecord {
    /// True when there is a predecessor and the content drifted from it
    pub fn is_drift(&self) -> bool {
        self.previous.is_some() && self.change_detected
    }
}

/// Compares snapshots read from the artifact store
pub struct DiffTracker {
    store: Arc<dyn ArtifactStore>,
}

impl DiffTracker {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    fn read_text(&self, id: &SnapshotId) -> Result<String> {
        let bytes = self.store.get(id)?;
        String::from_utf8(bytes)
            .map_err(|e| VaultError::invalid_format(format!("Snapshot {id} is not UTF-8: {e}")))
    }

    /// Diff a freshly stored snapshot against the one committed before it
    ///
    /// The first capture of a device has no predecessor and reports
    /// `change_detected = true`.
    pub fn compute_diff(
        &self,
        kind: DeviceKind,
        snapshot: &SnapshotMetadata,
    ) -> Result<DiffRecord> {
        let Some(previous) = self.store.predecessor(&snapshot.snapshot_id)? else {
            return Ok(DiffRecord {
                device_id: snapshot.device_id.clone(),
                previous: None,
                current: snapshot.snapshot_id.clone(),
                change_detected: true,
                summary: ChangeSummary::default(),
                created_at: Utc::now(),
            });
        };

        // Byte-identical captures share a hash; skip reading both blobs
        let summary = if previous.content_hash == snapshot.content_hash {
            ChangeSummary::default()
        } else {
            let old = self.read_text(&previous.snapshot_id)?;
            let new = self.read_text(&snapshot.snapshot_id)?;
            diff_contents(kind, &old, &new)
        };

        Ok(DiffRecord {
            device_id: snapshot.device_id.clone(),
            previous: Some(previous.snapshot_id),
            current: snapshot.snapshot_id.clone(),
            change_detected: !summary.is_empty(),
            summary,
            created_at: Utc::now(),
        })
    }

    /// Diff two arbitrary snapshots of one device
    pub fn diff_snapshots(
        &self,
        kind: DeviceKind,
        from: &SnapshotId,
        to: &SnapshotId,
    ) -> Result<DiffRecord> {
        if from.device_id() != to.device_id() {
            return Err(VaultError::validation(format!(
                "cannot diff snapshots of different devices ({from} vs {to})"
            )));
        }
        let old = self.read_text(from)?;
        let new = self.read_text(to)?;
        let summary = diff_contents(kind, &old, &new);
        Ok(DiffRecord {
            device_id: to.device_id().clone(),
            previous: Some(from.clone()),
            current: to.clone(),
            change_detected: !summary.is_empty(),
            summary,
            created_at: Utc::now(),
        })
    }

    /// Diff live device content against a stored snapshot
    pub fn diff_against(
        &self,
        kind: DeviceKind,
        live: &str,
        target: &SnapshotId,
    ) -> Result<ChangeSummary> {
        let target = self.read_text(target)?;
        Ok(diff_contents(kind, live, &target))
    }
}
