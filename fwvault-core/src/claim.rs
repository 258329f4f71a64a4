//! Per-device mutual exclusion between backups and restores.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::device::DeviceId;
use crate::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Backup,
    Restore,
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        })
    }
}

/// Devices currently being operated on
#[derive(Debug, Default)]
pub struct DeviceClaims {
    held: Mutex<HashMap<DeviceId, ClaimKind>>,
}

impl DeviceClaims {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the device or fail with `DeviceBusy`; released when the claim drops
    pub fn try_claim(self: &Arc<Self>, device_id: &DeviceId, kind: ClaimKind) -> Result<DeviceClaim> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = held.get(device_id) {
            return Err(VaultError::DeviceBusy(format!(
                "{device_id} ({existing} in progress)"
            )));
        }
        held.insert(device_id.clone(), kind);
        Ok(DeviceClaim {
            claims: Arc::clone(self),
            device_id: device_id.clone(),
        })
    }

    pub fn held_by(&self, device_id: &DeviceId) -> Option<ClaimKind> {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .copied()
    }

    pub fn is_held(&self, device_id: &DeviceId) -> bool {
        self.held_by(device_id).is_some()
    }
}

#[derive(Debug)]
#[must_use = "the claim is released when dropped"]
pub struct DeviceClaim {
    claims: Arc<DeviceClaims>,
    device_id: DeviceId,
}

impl DeviceClaim {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.claims
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.device_id);
    }
}
