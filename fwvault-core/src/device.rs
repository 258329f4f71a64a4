/*!
Device records as loaded from the inventory.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, VaultError};

const MAX_DEVICE_ID_LEN: usize = 64;

/// Stable identifier of a managed device
///
/// Restricted to ASCII letters, digits, `.`, `_` and `-` so it can be used
/// as a storage path segment and as the prefix of snapshot ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_DEVICE_ID_LEN {
            return Err(VaultError::validation(format!(
                "device id must be 1-{MAX_DEVICE_ID_LEN} characters, got {}",
                id.len()
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(VaultError::validation(format!(
                "device id '{id}' contains invalid character '{bad}'"
            )));
        }
        if id.starts_with('.') {
            return Err(VaultError::validation(format!(
                "device id '{id}' must not start with '.'"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// How configuration is retrieved from (and pushed to) a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMethod {
    /// Read-only export command over an interactive SSH session
    SshCli,
    /// On-device export followed by an SCP download
    Scp,
    /// Token-authenticated REST backup endpoint
    RestApi,
    /// A central manager that already holds the device configuration
    ManagerProxied,
}

impl TransportMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SshCli => "ssh_cli",
            Self::Scp => "scp",
            Self::RestApi => "rest_api",
            Self::ManagerProxied => "manager_proxied",
        }
    }

    /// Default port when the inventory leaves it out
    pub fn default_port(&self) -> u16 {
        match self {
            Self::SshCli | Self::Scp => 22,
            Self::RestApi | Self::ManagerProxied => 443,
        }
    }
}

impl fmt::Display for TransportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Export format family, used for capture validation and diff normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// FortiOS `config ... end` block syntax
    #[default]
    Fortigate,
    /// Any line-oriented text export
    Generic,
}

/// Opaque pointer to a secret held outside the inventory
///
/// Forms: `env:<PREFIX>` or `file:<KEY>`. Only the registry turns a
/// reference into a [`crate::credential::Credential`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CredentialRef {
    scheme: CredentialScheme,
    key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialScheme {
    Env,
    File,
}

impl CredentialRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, key) = raw.split_once(':').ok_or_else(|| {
            VaultError::validation(format!(
                "credential reference '{raw}' must look like env:<PREFIX> or file:<KEY>"
            ))
        })?;
        let scheme = match scheme {
            "env" => CredentialScheme::Env,
            "file" => CredentialScheme::File,
            other => {
                return Err(VaultError::validation(format!(
                    "unknown credential scheme '{other}'"
                )))
            }
        };
        if key.trim().is_empty() {
            return Err(VaultError::validation(format!(
                "credential reference '{raw}' has an empty key"
            )));
        }
        Ok(Self {
            scheme,
            key: key.to_string(),
        })
    }

    pub fn env<S: Into<String>>(prefix: S) -> Self {
        Self {
            scheme: CredentialScheme::Env,
            key: prefix.into(),
        }
    }

    pub fn file<S: Into<String>>(key: S) -> Self {
        Self {
            scheme: CredentialScheme::File,
            key: key.into(),
        }
    }

    pub fn scheme(&self) -> CredentialScheme {
        self.scheme
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            CredentialScheme::Env => "env",
            CredentialScheme::File => "file",
        };
        write!(f, "{scheme}:{}", self.key)
    }
}

impl TryFrom<String> for CredentialRef {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CredentialRef> for String {
    fn from(reference: CredentialRef) -> Self {
        reference.to_string()
    }
}

/// Transport-specific knobs; each variant reads only the fields it needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// SSH-CLI export command (default `show full-configuration`)
    pub fetch_command: Option<String>,
    /// SCP: command that writes the export file on the device
    pub export_command: Option<String>,
    /// SCP: path of the export file on the device
    pub remote_path: Option<String>,
    /// SCP: command run after an upload to apply it
    pub import_command: Option<String>,
    /// REST: backup endpoint path
    pub backup_path: Option<String>,
    /// REST: restore endpoint path
    pub restore_path: Option<String>,
    /// REST: FortiOS virtual domain scope
    pub vdom: Option<String>,
    /// REST: delay between polls of an asynchronous backup
    pub poll_interval_ms: Option<u64>,
    /// REST: maximum number of polls before giving up
    pub max_polls: Option<u32>,
    /// REST/manager: accept self-signed certificates
    pub insecure_tls: bool,
    /// Manager: base URL of the central manager
    pub manager_url: Option<String>,
    /// Manager: administrative domain holding the device
    pub adom: Option<String>,
    /// Manager: name the manager knows the device by (defaults to the device id)
    pub manager_device_name: Option<String>,
}

/// Where and how to reach a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub credential: CredentialRef,
    /// SSH host key fingerprint to pin (SHA-256, as printed by `ssh-keygen -l`)
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub options: TransportOptions,
}

/// A managed firewall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub kind: DeviceKind,
    pub transport: TransportMethod,
    pub connection: ConnectionParams,
    /// Schedule id this device opts into, in addition to group/all schedules
    #[serde(default)]
    pub schedule: Option<String>,
}

fn default_group() -> String {
    "default".to_string()
}

impl Device {
    /// Port to dial, falling back to the transport's default
    pub fn port(&self) -> u16 {
        self.connection
            .port
            .unwrap_or_else(|| self.transport.default_port())
    }

    /// Check field combinations serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() && self.transport != TransportMethod::ManagerProxied
        {
            return Err(VaultError::validation(format!(
                "device {} has an empty host",
                self.id
            )));
        }
        if self.group.trim().is_empty() {
            return Err(VaultError::validation(format!(
                "device {} has an empty group",
                self.id
            )));
        }
        let options = &self.connection.options;
        match self.transport {
            TransportMethod::Scp if options.remote_path.is_none() => {
                Err(VaultError::validation(format!(
                    "device {} uses scp but has no remote_path",
                    self.id
                )))
            }
            TransportMethod::ManagerProxied if options.manager_url.is_none() => {
                Err(VaultError::validation(format!(
                    "device {} is manager-proxied but has no manager_url",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }
}
