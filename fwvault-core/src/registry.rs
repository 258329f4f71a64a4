/*!
Device registry: the inventory of managed devices and the only path to
their credentials.
*/

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::credential::{Credential, CredentialResolver};
use crate::device::{Device, DeviceId};
use crate::{Result, VaultError};

/// One inventory entry that could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEntry {
    /// Position in the source list
    pub index: usize,
    /// Device id, when it could be read
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of an inventory load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<DeviceId>,
    pub rejected: Vec<RejectedEntry>,
    /// Devices present before a reload and absent after it
    pub removed: Vec<DeviceId>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Holds device records and resolves their credentials just in time
///
/// `get` and `list` return records that carry only a credential
/// *reference*; secrets come out of [`DeviceRegistry::resolve_credential`],
/// which writes an audit record for every call.
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, Device>>,
    resolver: Arc<dyn CredentialResolver>,
}

impl DeviceRegistry {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            resolver,
        }
    }

    /// Parse and insert raw inventory entries, rejecting bad ones individually
    pub fn import(&self, entries: &[serde_yaml::Value]) -> LoadReport {
        let (parsed, mut report) = parse_entries(entries);

        let mut devices = self.write_lock();
        for device in parsed {
            report.loaded.push(device.id.clone());
            devices.insert(device.id.clone(), device);
        }
        info!(
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            "Inventory imported"
        );
        report
    }

    /// Replace the whole inventory; devices missing from `entries` are removed
    ///
    /// The new inventory is swapped in under one write lock. A rejected entry
    /// whose id is readable keeps the device's previous record. Removal never
    /// touches stored snapshots.
    pub fn reload(&self, entries: &[serde_yaml::Value]) -> LoadReport {
        let (parsed, mut report) = parse_entries(entries);
        let mut next: BTreeMap<DeviceId, Device> = BTreeMap::new();
        for device in parsed {
            report.loaded.push(device.id.clone());
            next.insert(device.id.clone(), device);
        }

        let mut devices = self.write_lock();
        for rejected in &report.rejected {
            let Some(id) = rejected.id.as_deref().and_then(|raw| DeviceId::new(raw).ok()) else {
                continue;
            };
            if next.contains_key(&id) {
                continue;
            }
            if let Some(previous) = devices.get(&id) {
                warn!(device_id = %id, "Keeping previous record of rejected entry");
                next.insert(id, previous.clone());
            }
        }
        report.removed = devices
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        *devices = next;
        drop(devices);

        info!(
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            removed = report.removed.len(),
            "Inventory reloaded"
        );
        report
    }

    pub fn insert(&self, device: Device) -> Result<()> {
        device.validate()?;
        self.write_lock().insert(device.id.clone(), device);
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> Result<Device> {
        self.read_lock()
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::DeviceNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.read_lock().contains_key(id)
    }

    /// All devices, or only those in `group`, ordered by id
    pub fn list(&self, group: Option<&str>) -> Vec<Device> {
        self.read_lock()
            .values()
            .filter(|d| group.map_or(true, |g| d.group == g))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.read_lock().keys().cloned().collect()
    }

    pub fn remove(&self, id: &DeviceId) -> Result<Device> {
        let removed = self
            .write_lock()
            .remove(id)
            .ok_or_else(|| VaultError::DeviceNotFound(id.to_string()))?;
        info!(device_id = %id, "Device removed from registry");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    /// Resolve the secret for one transport call
    pub fn resolve_credential(&self, id: &DeviceId) -> Result<Credential> {
        let reference = self.get(id)?.connection.credential;
        match self.resolver.resolve(&reference) {
            Some(credential) => {
                info!(
                    target: "fwvault::audit",
                    device_id = %id,
                    reference = %reference,
                    kind = credential.kind(),
                    "Credential resolved"
                );
                Ok(credential)
            }
            None => {
                warn!(
                    target: "fwvault::audit",
                    device_id = %id,
                    reference = %reference,
                    "Credential reference did not resolve"
                );
                Err(VaultError::CredentialMissing(id.to_string()))
            }
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DeviceId, Device>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DeviceId, Device>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse entries in order; bad or duplicate ones land in the report
fn parse_entries(entries: &[serde_yaml::Value]) -> (Vec<Device>, LoadReport) {
    let mut report = LoadReport::default();
    let mut parsed = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match parse_entry(entry) {
            Ok(device) if !seen.insert(device.id.clone()) => {
                report.rejected.push(RejectedEntry {
                    index,
                    id,
                    reason: format!("duplicate device id {}", device.id),
                });
            }
            Ok(device) => parsed.push(device),
            Err(err) => report.rejected.push(RejectedEntry {
                index,
                id,
                reason: err.to_string(),
            }),
        }
    }

    for rejected in &report.rejected {
        warn!(
            index = rejected.index,
            device_id = rejected.id.as_deref().unwrap_or("<unknown>"),
            reason = %rejected.reason,
            "Rejected inventory entry"
        );
    }
    (parsed, report)
}

fn parse_entry(entry: &serde_yaml::Value) -> Result<Device> {
    let device: Device = serde_yaml::from_value(entry.clone())?;
    device.validate()?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{MockCredentialResolver, StaticCredentialResolver};
    use crate::device::{CredentialRef, TransportMethod};

    fn entries(yaml: &str) -> Vec<serde_yaml::Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    const INVENTORY: &str = r#"
- id: fw-01
  group: branch
  transport: ssh_cli
  connection: { host: 10.0.0.1, credential: "env:FW01" }
- id: fw-02
  group: dc
  transport: rest_api
  connection: { host: 10.0.0.2, credential: "file:fw-02" }
- id: "bad id"
  transport: ssh_cli
  connection: { host: 10.0.0.3, credential: "env:X" }
- id: fw-04
  transport: carrier_pigeon
  connection: { host: 10.0.0.4, credential: "env:X" }
- id: fw-01
  transport: ssh_cli
  connection: { host: 10.0.0.5, credential: "env:X" }
"#;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(StaticCredentialResolver::new()))
    }

    #[test]
    fn test_malformed_entries_rejected_individually() {
        let registry = registry();
        let report = registry.import(&entries(INVENTORY));

        assert_eq!(report.loaded.len(), 2);
        assert_eq!(report.rejected.len(), 3);
        assert_eq!(report.rejected[0].index, 2);
        assert_eq!(report.rejected[1].id.as_deref(), Some("fw-04"));
        assert!(report.rejected[2].reason.contains("duplicate"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_list_filters_by_group() {
        let registry = registry();
        registry.import(&entries(INVENTORY));

        let branch = registry.list(Some("branch"));
        assert_eq!(branch.len(), 1);
        assert_eq!(branch[0].id.as_str(), "fw-01");
        assert_eq!(registry.list(None).len(), 2);
        assert!(registry.list(Some("nowhere")).is_empty());
    }

    #[test]
    fn test_get_missing_device() {
        let registry = registry();
        let err = registry.get(&DeviceId::new("ghost").unwrap()).unwrap_err();
        assert!(matches!(err, VaultError::DeviceNotFound(_)));
    }

    #[test]
    fn test_reload_reports_removed_devices() {
        let registry = registry();
        registry.import(&entries(INVENTORY));

        let report = registry.reload(&entries(
            r#"
- id: fw-02
  transport: rest_api
  connection: { host: 10.0.0.2, credential: "file:fw-02" }
"#,
        ));
        assert_eq!(report.removed, vec![DeviceId::new("fw-01").unwrap()]);
        assert_eq!(registry.ids(), vec![DeviceId::new("fw-02").unwrap()]);
    }

    #[test]
    fn test_reload_keeps_previous_record_of_rejected_entry() {
        let registry = registry();
        registry.import(&entries(INVENTORY));
        let fw02 = DeviceId::new("fw-02").unwrap();

        let report = registry.reload(&entries(
            r#"
- id: fw-01
  transport: ssh_cli
  connection: { host: 10.0.0.9, credential: "env:FW01" }
- id: fw-02
  transport: carrier_pigeon
  connection: { host: 10.0.0.2, credential: "file:fw-02" }
"#,
        ));
        assert_eq!(report.rejected.len(), 1);
        assert!(report.removed.is_empty());
        assert_eq!(report.loaded, vec![DeviceId::new("fw-01").unwrap()]);

        // The good record survives; the valid entry replaces its device
        let kept = registry.get(&fw02).unwrap();
        assert_eq!(kept.transport, TransportMethod::RestApi);
        assert_eq!(kept.group, "dc");
        let fw01 = registry.get(&DeviceId::new("fw-01").unwrap()).unwrap();
        assert_eq!(fw01.connection.host, "10.0.0.9");
    }

    #[test]
    fn test_resolve_credential_uses_reference() {
        let mut resolver = MockCredentialResolver::new();
        resolver
            .expect_resolve()
            .withf(|r: &CredentialRef| r.to_string() == "env:FW01")
            .times(1)
            .returning(|_| Some(Credential::password("admin", "pw")));
        let registry = DeviceRegistry::new(Arc::new(resolver));
        registry.import(&entries(INVENTORY));

        let credential = registry
            .resolve_credential(&DeviceId::new("fw-01").unwrap())
            .unwrap();
        assert_eq!(credential.username(), Some("admin"));
    }

    #[test]
    fn test_resolve_credential_missing() {
        let registry = registry();
        registry.import(&entries(INVENTORY));
        let err = registry
            .resolve_credential(&DeviceId::new("fw-02").unwrap())
            .unwrap_err();
        assert!(matches!(err, VaultError::CredentialMissing(_)));
    }

    #[test]
    fn test_records_do_not_carry_secrets() {
        let registry = DeviceRegistry::new(Arc::new(
            StaticCredentialResolver::new()
                .insert(&CredentialRef::env("FW01"), Credential::password("admin", "pw-123")),
        ));
        registry.import(&entries(INVENTORY));
        let device = registry.get(&DeviceId::new("fw-01").unwrap()).unwrap();
        let exported = serde_json::to_string(&device).unwrap();
        assert!(!exported.contains("pw-123"));
        assert!(exported.contains("env:FW01"));
    }
}
