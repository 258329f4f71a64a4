/*!
Manager-proxied transport: read a device's last-known configuration from a
central manager over JSON-RPC instead of contacting the device.

The manager keeps configuration revisions per device; the newest revision is
returned. This transport never talks to the device itself and has no push
path.
*/

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::rest::{http_client, map_request_error, map_status};
use super::{BackupTransport, RawConfig};
use crate::credential::Credential;
use crate::device::{Device, TransportMethod};
use crate::error::TransportError;

const DEFAULT_ADOM: &str = "root";
/// Manager status codes that mean the session or token lacks access
const AUTH_STATUS_CODES: [i64; 2] = [-11, -22];

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct RpcStatus {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
struct RpcResult {
    status: RpcStatus,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize, Debug)]
struct RpcResponse {
    #[serde(default)]
    result: Vec<RpcResult>,
    #[serde(default)]
    session: Option<String>,
}

/// Authentication attached to each call
enum ManagerAuth {
    Bearer(String),
    Session(String),
}

struct RpcClient<'a> {
    client: Client,
    url: String,
    auth: Option<ManagerAuth>,
    timeout: Duration,
    device: &'a Device,
}

impl<'a> RpcClient<'a> {
    async fn call(&self, method: &str, params: Value) -> Result<RpcResponse, TransportError> {
        let session = match &self.auth {
            Some(ManagerAuth::Session(s)) => Some(s.as_str()),
            _ => None,
        };
        let request = RpcRequest {
            id: 1,
            method,
            params: vec![params],
            session,
        };
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(ManagerAuth::Bearer(token)) = &self.auth {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_request_error(e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, "manager request"));
        }
        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| TransportError::protocol(format!("malformed manager reply: {e}")))
    }

    /// Call and return the first result's data, mapping manager status codes
    async fn data(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let response = self.call(method, params).await?;
        let first = response
            .result
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::protocol("manager reply has no result"))?;
        check_status(&first.status, self.device)?;
        Ok(first.data)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let response = self
            .call(
                "exec",
                json!({ "url": "/sys/login/user", "data": { "user": username, "passwd": password } }),
            )
            .await?;
        if let Some(first) = response.result.first() {
            check_status(&first.status, self.device)?;
        }
        let session = response
            .session
            .ok_or_else(|| TransportError::auth("manager login returned no session"))?;
        self.auth = Some(ManagerAuth::Session(session));
        Ok(())
    }

    async fn logout(&self) {
        if matches!(self.auth, Some(ManagerAuth::Session(_))) {
            let _ = self
                .call("exec", json!({ "url": "/sys/logout" }))
                .await;
        }
    }
}

fn check_status(status: &RpcStatus, device: &Device) -> Result<(), TransportError> {
    match status.code {
        0 => Ok(()),
        code if AUTH_STATUS_CODES.contains(&code) => Err(TransportError::auth(format!(
            "manager denied access for {}: {}",
            device.id, status.message
        ))),
        code => Err(TransportError::protocol(format!(
            "manager status {code}: {}",
            status.message
        ))),
    }
}

/// Highest revision id in a revision listing
fn latest_revision(listing: &Value) -> Option<i64> {
    listing
        .as_array()?
        .iter()
        .filter_map(|rev| rev.get("oid").and_then(Value::as_i64))
        .max()
}

#[derive(Debug, Default, Clone)]
pub struct ManagerTransport;

impl ManagerTransport {
    pub fn new() -> Self {
        Self
    }

    fn endpoint(device: &Device) -> String {
        match &device.connection.options.manager_url {
            Some(url) => format!("{}/jsonrpc", url.trim_end_matches('/')),
            None => format!(
                "https://{}:{}/jsonrpc",
                device.connection.host,
                device.port()
            ),
        }
    }

    async fn fetch_latest(rpc: &RpcClient<'_>) -> Result<String, TransportError> {
        let device = rpc.device;
        let options = &device.connection.options;
        let adom = options.adom.as_deref().unwrap_or(DEFAULT_ADOM);
        let name = options
            .manager_device_name
            .as_deref()
            .unwrap_or(device.id.as_str());
        let base = format!("/dvmdb/adom/{adom}/device/{name}/revision");

        let listing = rpc.data("get", json!({ "url": base })).await?;
        let revision = latest_revision(&listing).ok_or_else(|| {
            TransportError::protocol(format!("manager holds no revision for {name}"))
        })?;
        debug!(device_id = %device.id, revision, "Fetching manager revision");

        let data = rpc
            .data(
                "get",
                json!({ "url": format!("{base}/{revision}"), "option": ["content"] }),
            )
            .await?;
        data.get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::protocol("revision carries no content"))
    }
}

#[async_trait]
impl BackupTransport for ManagerTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::ManagerProxied
    }

    async fn fetch_config(
        &self,
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<RawConfig, TransportError> {
        let mut rpc = RpcClient {
            client: http_client(device.connection.options.insecure_tls, timeout)?,
            url: Self::endpoint(device),
            auth: None,
            timeout,
            device,
        };

        match credential {
            Credential::Token { token } => {
                rpc.auth = Some(ManagerAuth::Bearer(token.expose().to_string()))
            }
            Credential::Password { username, password } => {
                rpc.login(username, password.expose()).await?
            }
            Credential::PrivateKey { .. } => {
                return Err(TransportError::auth(
                    "manager transport needs a token or password credential",
                ))
            }
        }

        let result = Self::fetch_latest(&rpc).await;
        rpc.logout().await;
        Ok(RawConfig::new(result?))
    }
}
