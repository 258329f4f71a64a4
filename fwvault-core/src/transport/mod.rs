/*!
Backup transports: how configuration is read from, and written back to, a device.

Every variant implements the read-only [`BackupTransport::fetch_config`]
capability. Restore-capable variants also expose a [`ConfigPusher`] through
[`BackupTransport::pusher`]; the write path is a separate trait so a
fetch-only transport cannot be asked to modify a device.

Deadlines are enforced by the caller. A transport receives the timeout so
it can size protocol-level knobs, but the execution engine wraps every call
in its own cancelable timeout.
*/

#[cfg(feature = "http")]
pub mod manager;
#[cfg(feature = "http")]
pub mod rest;
#[cfg(feature = "ssh")]
pub mod scp;
pub mod scripted;
#[cfg(feature = "ssh")]
pub mod ssh;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::credential::Credential;
use crate::device::{Device, TransportMethod};
use crate::error::TransportError;
use crate::metadata::DeviceInfo;
use crate::{Result, VaultError};

pub use scripted::{ScriptedTransport, Step};

/// Configuration text as returned by a device
#[derive(Debug, Clone, PartialEq)]
pub struct RawConfig {
    pub content: String,
    pub device_info: Option<DeviceInfo>,
}

impl RawConfig {
    /// Wrap content, reading device facts from its export header
    pub fn new<S: Into<String>>(content: S) -> Self {
        let content = content.into();
        let device_info = DeviceInfo::from_export(&content);
        Self {
            content,
            device_info,
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Read-only retrieval of a device's configuration
#[async_trait]
pub trait BackupTransport: Send + Sync {
    fn method(&self) -> TransportMethod;

    /// Fetch the running configuration; must not alter device state
    async fn fetch_config(
        &self,
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> std::result::Result<RawConfig, TransportError>;

    /// Write-capable counterpart, for transports that can restore
    fn pusher(&self) -> Option<&dyn ConfigPusher> {
        None
    }
}

/// Write path used only by the restore engine
#[async_trait]
pub trait ConfigPusher: Send + Sync {
    async fn push_config(
        &self,
        device: &Device,
        credential: &Credential,
        content: &str,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError>;
}

/// Maps a device's transport method to an implementation
pub trait TransportProvider: Send + Sync {
    fn transport_for(&self, method: TransportMethod) -> Result<Arc<dyn BackupTransport>>;
}

/// Fixed table of transports, one per method
#[derive(Default, Clone)]
pub struct TransportRegistry {
    transports: HashMap<TransportMethod, Arc<dyn BackupTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` under the method it reports
    pub fn with(mut self, transport: Arc<dyn BackupTransport>) -> Self {
        self.transports.insert(transport.method(), transport);
        self
    }

    /// Register one transport for every method
    pub fn uniform(transport: Arc<dyn BackupTransport>) -> Self {
        let transports = [
            TransportMethod::SshCli,
            TransportMethod::Scp,
            TransportMethod::RestApi,
            TransportMethod::ManagerProxied,
        ]
        .into_iter()
        .map(|m| (m, Arc::clone(&transport)))
        .collect();
        Self { transports }
    }

    /// The network transports compiled into this build
    pub fn network() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "ssh")]
        {
            registry = registry
                .with(Arc::new(ssh::SshCliTransport::new()))
                .with(Arc::new(scp::ScpTransport::new()));
        }
        #[cfg(feature = "http")]
        {
            registry = registry
                .with(Arc::new(rest::RestApiTransport::new()))
                .with(Arc::new(manager::ManagerTransport::new()));
        }
        registry
    }
}

impl TransportProvider for TransportRegistry {
    fn transport_for(&self, method: TransportMethod) -> Result<Arc<dyn BackupTransport>> {
        self.transports.get(&method).cloned().ok_or_else(|| {
            VaultError::Unsupported(format!("transport {method} is not available in this build"))
        })
    }
}
