//! SCP file-copy transport: the device exposes its configuration as a file.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::ssh::SshConnection;
use super::{BackupTransport, ConfigPusher, RawConfig};
use crate::credential::Credential;
use crate::device::{Device, TransportMethod};
use crate::error::TransportError;

/// FortiOS serves the running configuration at this path when SCP is enabled
pub const DEFAULT_REMOTE_PATH: &str = "sys_config";

#[derive(Debug, Default, Clone)]
pub struct ScpTransport;

impl ScpTransport {
    pub fn new() -> Self {
        Self
    }

    fn remote_path(device: &Device) -> &str {
        device
            .connection
            .options
            .remote_path
            .as_deref()
            .unwrap_or(DEFAULT_REMOTE_PATH)
    }
}

#[async_trait]
impl BackupTransport for ScpTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Scp
    }

    async fn fetch_config(
        &self,
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<RawConfig, TransportError> {
        let remote_path = Self::remote_path(device);
        let connection = SshConnection::open(device, credential, timeout).await?;
        let result = async {
            if let Some(export) = &device.connection.options.export_command {
                debug!(device_id = %device.id, command = %export, "Running export before copy");
                connection.exec(export).await?;
            }
            connection.scp_download(remote_path).await
        }
        .await;
        connection.close().await;

        let content = String::from_utf8(result?).map_err(|e| {
            TransportError::protocol(format!("{remote_path} is not UTF-8 text: {e}"))
        })?;
        Ok(RawConfig::new(content))
    }

    fn pusher(&self) -> Option<&dyn ConfigPusher> {
        Some(self)
    }
}

#[async_trait]
impl ConfigPusher for ScpTransport {
    async fn push_config(
        &self,
        device: &Device,
        credential: &Credential,
        content: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let remote_path = Self::remote_path(device);
        let connection = SshConnection::open(device, credential, timeout).await?;
        let result = async {
            connection
                .scp_upload(remote_path, content.as_bytes())
                .await?;
            if let Some(import) = &device.connection.options.import_command {
                debug!(device_id = %device.id, command = %import, "Running import after copy");
                connection.exec(import).await?;
            }
            Ok::<(), TransportError>(())
        }
        .await;
        connection.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionParams, CredentialRef, DeviceId, DeviceKind, TransportOptions};

    #[test]
    fn test_remote_path_default_and_override() {
        let mut device = Device {
            id: DeviceId::new("fw-scp").unwrap(),
            group: "default".to_string(),
            kind: DeviceKind::Generic,
            transport: TransportMethod::Scp,
            connection: ConnectionParams {
                host: "10.0.0.9".to_string(),
                port: None,
                credential: CredentialRef::env("FWSCP"),
                host_key_fingerprint: None,
                options: TransportOptions::default(),
            },
            schedule: None,
        };
        assert_eq!(ScpTransport::remote_path(&device), "sys_config");

        device.connection.options.remote_path = Some("/flash/running.cfg".to_string());
        assert_eq!(ScpTransport::remote_path(&device), "/flash/running.cfg");
    }
}
