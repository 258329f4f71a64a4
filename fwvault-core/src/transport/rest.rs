/*!
REST-API transport: token-authenticated backup and restore endpoints.

Defaults target the FortiOS monitor API. A `202 Accepted` answer means the
device is preparing the export asynchronously; the `Location` header is then
polled until the file is ready.
*/

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{BackupTransport, ConfigPusher, RawConfig};
use crate::credential::Credential;
use crate::device::{Device, TransportMethod};
use crate::error::TransportError;

pub const DEFAULT_BACKUP_PATH: &str = "/api/v2/monitor/system/config/backup";
pub const DEFAULT_RESTORE_PATH: &str = "/api/v2/monitor/system/config/restore";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_MAX_POLLS: u32 = 30;

/// Build an HTTP client for one device call
pub(crate) fn http_client(insecure_tls: bool, timeout: Duration) -> Result<Client, TransportError> {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(insecure_tls)
        .build()
        .map_err(|e| TransportError::protocol(format!("failed to build HTTP client: {e}")))
}

/// Classify a reqwest failure
pub(crate) fn map_request_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::unreachable(error.to_string())
    } else {
        TransportError::protocol(error.to_string())
    }
}

/// Classify a non-success HTTP status
pub(crate) fn map_status(status: StatusCode, context: &str) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::auth(format!("{context}: HTTP {status}"))
        }
        _ => TransportError::protocol(format!("{context}: unexpected HTTP {status}")),
    }
}

fn bearer_token(credential: &Credential) -> Result<&str, TransportError> {
    match credential {
        Credential::Token { token } => Ok(token.expose()),
        other => Err(TransportError::auth(format!(
            "REST transport needs an API token, got a {} credential",
            other.kind()
        ))),
    }
}

#[derive(Deserialize)]
struct RestoreReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// FortiOS-style REST transport
#[derive(Debug, Default, Clone)]
pub struct RestApiTransport;

impl RestApiTransport {
    pub fn new() -> Self {
        Self
    }

    fn base_url(device: &Device) -> String {
        format!("https://{}:{}", device.connection.host, device.port())
    }

    fn scope(device: &Device) -> Vec<(&'static str, String)> {
        match &device.connection.options.vdom {
            Some(vdom) => vec![("scope", "vdom".to_string()), ("vdom", vdom.clone())],
            None => vec![("scope", "global".to_string())],
        }
    }

    async fn poll(
        &self,
        client: &Client,
        device: &Device,
        token: &str,
        location: &str,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let options = &device.connection.options;
        let interval = Duration::from_millis(
            options.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        let max_polls = options.max_polls.unwrap_or(DEFAULT_MAX_POLLS);
        let url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{location}", Self::base_url(device))
        };

        for attempt in 1..=max_polls {
            tokio::time::sleep(interval).await;
            let response = client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| map_request_error(e, timeout))?;
            match response.status() {
                StatusCode::OK => return Ok(response),
                StatusCode::ACCEPTED => {
                    debug!(device_id = %device.id, attempt, "Backup still being prepared");
                }
                status => return Err(map_status(status, "backup poll")),
            }
        }
        Err(TransportError::protocol(format!(
            "backup not ready after {max_polls} polls"
        )))
    }
}

#[async_trait]
impl BackupTransport for RestApiTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::RestApi
    }

    async fn fetch_config(
        &self,
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<RawConfig, TransportError> {
        let token = bearer_token(credential)?;
        let options = &device.connection.options;
        let client = http_client(options.insecure_tls, timeout)?;
        let path = options
            .backup_path
            .as_deref()
            .unwrap_or(DEFAULT_BACKUP_PATH);

        let response = client
            .get(format!("{}{path}", Self::base_url(device)))
            .query(&Self::scope(device))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| map_request_error(e, timeout))?;

        let response = match response.status() {
            StatusCode::OK => response,
            StatusCode::ACCEPTED => {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        TransportError::protocol("202 Accepted without a Location header")
                    })?
                    .to_string();
                self.poll(&client, device, token, &location, timeout)
                    .await?
            }
            status => return Err(map_status(status, "backup request")),
        };

        let content = response
            .text()
            .await
            .map_err(|e| map_request_error(e, timeout))?;
        Ok(RawConfig::new(content))
    }

    fn pusher(&self) -> Option<&dyn ConfigPusher> {
        Some(self)
    }
}

#[async_trait]
impl ConfigPusher for RestApiTransport {
    async fn push_config(
        &self,
        device: &Device,
        credential: &Credential,
        content: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let token = bearer_token(credential)?;
        let options = &device.connection.options;
        let client = http_client(options.insecure_tls, timeout)?;
        let path = options
            .restore_path
            .as_deref()
            .unwrap_or(DEFAULT_RESTORE_PATH);

        let mut body = json!({
            "source": "upload",
            "file_content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        for (key, value) in Self::scope(device) {
            body[key] = json!(value);
        }

        let response = client
            .post(format!("{}{path}", Self::base_url(device)))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, "restore request"));
        }
        // Some firmware answers 200 with an error status in the body
        if let Ok(reply) = response.json::<RestoreReply>().await {
            if reply.status.as_deref() == Some("error") {
                return Err(TransportError::protocol(format!(
                    "device rejected restore: {}",
                    reply.error.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionParams, CredentialRef, DeviceId, DeviceKind, TransportOptions};

    fn device(vdom: Option<&str>) -> Device {
        Device {
            id: DeviceId::new("fw-api").unwrap(),
            group: "dc".to_string(),
            kind: DeviceKind::Fortigate,
            transport: TransportMethod::RestApi,
            connection: ConnectionParams {
                host: "fw.example.net".to_string(),
                port: Some(8443),
                credential: CredentialRef::env("FWAPI"),
                host_key_fingerprint: None,
                options: TransportOptions {
                    vdom: vdom.map(str::to_string),
                    ..TransportOptions::default()
                },
            },
            schedule: None,
        }
    }

    #[test]
    fn test_base_url_uses_port() {
        assert_eq!(
            RestApiTransport::base_url(&device(None)),
            "https://fw.example.net:8443"
        );
    }

    #[test]
    fn test_scope_parameters() {
        assert_eq!(
            RestApiTransport::scope(&device(None)),
            vec![("scope", "global".to_string())]
        );
        assert_eq!(
            RestApiTransport::scope(&device(Some("root"))),
            vec![("scope", "vdom".to_string()), ("vdom", "root".to_string())]
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "x"),
            TransportError::AuthFailure(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, "x"),
            TransportError::AuthFailure(_)
        ));
        assert!(matches!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, "x"),
            TransportError::Protocol(_)
        ));
    }

    #[test]
    fn test_password_credential_rejected() {
        let err = bearer_token(&Credential::password("admin", "pw")).unwrap_err();
        assert!(matches!(err, TransportError::AuthFailure(_)));
        assert_eq!(bearer_token(&Credential::token("abc")).unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let mut device = device(None);
        device.connection.host = "127.0.0.1".to_string();
        device.connection.port = Some(1);
        let err = RestApiTransport::new()
            .fetch_config(&device, &Credential::token("t"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unreachable(_) | TransportError::Timeout(_)
        ));
    }
}
