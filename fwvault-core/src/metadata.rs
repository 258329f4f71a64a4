/*!
Snapshot metadata management and schema definition.
*/

use crate::device::{DeviceId, TransportMethod};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Current metadata format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Identifier of one snapshot: `<device-id>:<sequence>`
///
/// The sequence is zero-padded to six digits so ids sort in capture order
/// for devices with fewer than a million snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    device_id: DeviceId,
    sequence: u64,
}

impl SnapshotId {
    pub fn new(device_id: DeviceId, sequence: u64) -> Self {
        Self {
            device_id,
            sequence,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (device, sequence) = raw.rsplit_once(':').ok_or_else(|| {
            VaultError::validation(format!(
                "snapshot id '{raw}' must look like <device>:<sequence>"
            ))
        })?;
        let sequence = sequence.parse::<u64>().map_err(|_| {
            VaultError::validation(format!("snapshot id '{raw}' has a non-numeric sequence"))
        })?;
        Ok(Self::new(DeviceId::new(device)?, sequence))
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:06}", self.device_id, self.sequence)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.to_string()
    }
}

impl std::str::FromStr for SnapshotId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Device facts read from the export header
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl DeviceInfo {
    /// Parse a FortiOS `#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:...` header
    pub fn from_export(content: &str) -> Option<Self> {
        let header = content
            .lines()
            .take(20)
            .find_map(|line| line.trim().strip_prefix("#config-version="))?;
        let image = header.split(':').next().unwrap_or_default();
        let mut parts = image.split('-');

        let info = Self {
            model: parts.next().filter(|p| !p.is_empty()).map(str::to_string),
            version: parts.next().filter(|p| !p.is_empty()).map(str::to_string),
            build: image
                .split('-')
                .find_map(|p| p.strip_prefix("build"))
                .map(str::to_string),
        };
        (info != Self::default()).then_some(info)
    }
}

/// Facts about a capture supplied by the caller of `put`
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureInfo {
    pub transport: TransportMethod,
    pub device_info: Option<DeviceInfo>,
    /// Job that produced the capture, if any
    pub job_id: Option<String>,
}

impl CaptureInfo {
    pub fn new(transport: TransportMethod) -> Self {
        Self {
            transport,
            device_info: None,
            job_id: None,
        }
    }

    pub fn with_device_info(mut self, info: Option<DeviceInfo>) -> Self {
        self.device_info = info;
        self
    }

    pub fn with_job<S: Into<String>>(mut self, job_id: S) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Metadata for each snapshot providing traceability and integrity verification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    pub snapshot_id: SnapshotId,

    pub device_id: DeviceId,

    /// Position in the device's snapshot sequence (0, 1, 2, ...)
    pub sequence: u64,

    /// When the capture was committed; strictly increasing per device
    pub captured_at: DateTime<Utc>,

    /// SHA-256 of the raw configuration text
    pub content_hash: String,

    /// Size of the raw configuration in bytes
    pub size: usize,

    /// Size of the stored blob in bytes
    pub stored_size: Option<usize>,

    pub compression_algorithm: String,

    pub transport: TransportMethod,

    #[serde(default)]
    pub device_info: Option<DeviceInfo>,

    #[serde(default)]
    pub job_id: Option<String>,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,
}

impl SnapshotMetadata {
    /// Create metadata for the `sequence`-th capture of a device
    ///
    /// # Example
    /// ```rust
    /// use fwvault_core::{DeviceId, SnapshotMetadata, TransportMethod};
    ///
    /// let device = DeviceId::new("fw-01").unwrap();
    /// let metadata = SnapshotMetadata::new(device, 3, TransportMethod::SshCli);
    /// assert_eq!(metadata.snapshot_id.to_string(), "fw-01:000003");
    /// ```
    pub fn new(device_id: DeviceId, sequence: u64, transport: TransportMethod) -> Self {
        Self {
            snapshot_id: SnapshotId::new(device_id.clone(), sequence),
            device_id,
            sequence,
            captured_at: Utc::now(),
            content_hash: String::new(),
            size: 0,
            stored_size: None,
            compression_algorithm: "gzip".to_string(),
            transport,
            device_info: None,
            job_id: None,
            format_version: METADATA_FORMAT_VERSION,
        }
    }

    /// Set the content hash and raw size from the configuration bytes
    pub fn with_content_hash(mut self, content: &[u8]) -> Self {
        self.content_hash = Self::compute_hash(content);
        self.size = content.len();
        self
    }

    pub fn with_stored_size(mut self, stored_size: usize) -> Self {
        self.stored_size = Some(stored_size);
        self
    }

    pub fn with_compression_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.compression_algorithm = algorithm.into();
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn with_capture_info(mut self, info: CaptureInfo) -> Self {
        self.transport = info.transport;
        self.device_info = info.device_info;
        self.job_id = info.job_id;
        self
    }

    /// Compute SHA-256 hash of the provided data as lowercase hex
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Verify configuration bytes against the stored hash
    pub fn verify_integrity(&self, content: &[u8]) -> Result<()> {
        let computed_hash = Self::compute_hash(content);
        if computed_hash == self.content_hash {
            Ok(())
        } else {
            Err(VaultError::IntegrityCheckFailed {
                expected: self.content_hash.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.content_hash.len() != 64 {
            return Err(VaultError::validation(
                "content_hash must be a SHA-256 hex digest",
            ));
        }
        if self.snapshot_id.device_id() != &self.device_id
            || self.snapshot_id.sequence() != self.sequence
        {
            return Err(VaultError::validation(format!(
                "snapshot id {} does not match device {} sequence {}",
                self.snapshot_id, self.device_id, self.sequence
            )));
        }
        Ok(())
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }

    /// First 12 hex characters of the content hash, for tables and logs
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..self.content_hash.len().min(12)]
    }

    /// Name an operator would give the file when exporting this snapshot
    ///
    /// Format: {device_id}_{YYYYmmdd_HHMMSS}.conf
    pub fn suggested_filename(&self) -> String {
        format!(
            "{}_{}.conf",
            self.device_id,
            self.captured_at.format("%Y%m%d_%H%M%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::new("fw-01").unwrap()
    }

    #[test]
    fn test_metadata_creation() {
        let metadata = SnapshotMetadata::new(device(), 0, TransportMethod::SshCli);
        assert_eq!(metadata.device_id.as_str(), "fw-01");
        assert_eq!(metadata.sequence, 0);
        assert_eq!(metadata.format_version, METADATA_FORMAT_VERSION);
        assert_eq!(metadata.snapshot_id.to_string(), "fw-01:000000");
    }

    #[test]
    fn test_content_hash() {
        let hash = SnapshotMetadata::compute_hash(b"test data");
        assert_eq!(
            hash,
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_integrity_verification() {
        let data = b"config system global\nend\n";
        let metadata =
            SnapshotMetadata::new(device(), 0, TransportMethod::Scp).with_content_hash(data);

        assert!(metadata.verify_integrity(data).is_ok());
        assert!(matches!(
            metadata.verify_integrity(b"config system dns\nend\n"),
            Err(VaultError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let metadata =
            SnapshotMetadata::new(device(), 1, TransportMethod::RestApi).with_content_hash(b"x");
        assert!(metadata.validate().is_ok());

        let mut broken = metadata.clone();
        broken.content_hash = "short".to_string();
        assert!(broken.validate().is_err());

        let mut mismatched = metadata;
        mismatched.sequence = 7;
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn test_snapshot_id_parse() {
        let id = SnapshotId::parse("edge.fw-2:000042").unwrap();
        assert_eq!(id.device_id().as_str(), "edge.fw-2");
        assert_eq!(id.sequence(), 42);
        assert_eq!(id.to_string(), "edge.fw-2:000042");

        assert!(SnapshotId::parse("fw-01").is_err());
        assert!(SnapshotId::parse("fw-01:abc").is_err());
        assert!(SnapshotId::parse("bad id:1").is_err());
    }

    #[test]
    fn test_device_info_from_header() {
        let export = "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:vdom=0:user=admin\n#conf_file_ver=1234\nconfig system global\nend\n";
        let info = DeviceInfo::from_export(export).unwrap();
        assert_eq!(info.model.as_deref(), Some("FGT60F"));
        assert_eq!(info.version.as_deref(), Some("7.2.5"));
        assert_eq!(info.build.as_deref(), Some("1517"));

        assert!(DeviceInfo::from_export("config system global\nend\n").is_none());
    }
}
