/*!
SSH transports built on russh.

[`SshConnection`] owns one authenticated session and offers the three
channel styles the device transports need: an interactive shell (CLI
export and line-by-line restore), a one-shot `exec`, and the SCP
source/sink protocol used by [`super::scp::ScpTransport`].
*/

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{BackupTransport, ConfigPusher, RawConfig};
use crate::credential::Credential;
use crate::device::{Device, TransportMethod};
use crate::error::TransportError;
use crate::validation::{clean_cli_output, is_cli_prompt};

pub const DEFAULT_FETCH_COMMAND: &str = "show full-configuration";
const PAGER_MARKER: &str = "--More--";
/// Device replies that mean a pushed line was not accepted
const REJECTION_MARKERS: [&str; 3] = ["Command fail", "Unknown action", "command parse error"];

/// Host key policy for one connection
struct HostKeyCheck {
    expected: Option<String>,
}

fn normalize_fingerprint(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("SHA256:")
        .trim_end_matches('=')
        .to_string()
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.expected else {
            return Ok(true);
        };
        let presented = normalize_fingerprint(&server_public_key.fingerprint());
        let matches = presented == normalize_fingerprint(expected);
        if !matches {
            warn!(presented = %presented, "Host key fingerprint mismatch");
        }
        Ok(matches)
    }
}

fn map_ssh_error(error: russh::Error) -> TransportError {
    match error {
        russh::Error::UnknownKey | russh::Error::WrongServerSig => {
            TransportError::protocol("host key fingerprint mismatch")
        }
        russh::Error::NoAuthMethod | russh::Error::NotAuthenticated => {
            TransportError::auth(error.to_string())
        }
        russh::Error::ConnectionTimeout | russh::Error::InactivityTimeout => {
            TransportError::unreachable(error.to_string())
        }
        russh::Error::IO(e) => TransportError::unreachable(e.to_string()),
        other => TransportError::protocol(other.to_string()),
    }
}

/// Authenticated SSH session to one device
pub struct SshConnection {
    handle: client::Handle<HostKeyCheck>,
}

impl SshConnection {
    pub async fn open(
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        });
        let host = device.connection.host.as_str();
        let port = device.port();

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::unreachable(format!("{host}:{port}: {e}")))?;
        let handler = HostKeyCheck {
            expected: device.connection.host_key_fingerprint.clone(),
        };
        let mut handle = client::connect_stream(config, stream, handler)
            .await
            .map_err(map_ssh_error)?;

        let authenticated = match credential {
            Credential::Password { username, password } => handle
                .authenticate_password(username, password.expose())
                .await
                .map_err(map_ssh_error)?,
            Credential::PrivateKey {
                username,
                key_path,
                passphrase,
            } => {
                let content = tokio::fs::read_to_string(key_path).await.map_err(|e| {
                    TransportError::auth(format!("cannot read key {}: {e}", key_path.display()))
                })?;
                let key = russh_keys::decode_secret_key(
                    &content,
                    passphrase.as_ref().map(|p| p.expose()),
                )
                .map_err(|e| {
                    TransportError::auth(format!("cannot decode key {}: {e}", key_path.display()))
                })?;
                handle
                    .authenticate_publickey(username, Arc::new(key))
                    .await
                    .map_err(map_ssh_error)?
            }
            Credential::Token { .. } => {
                return Err(TransportError::auth(
                    "SSH needs a password or private key credential",
                ))
            }
        };

        if !authenticated {
            return Err(TransportError::auth(format!(
                "device {} rejected the credential",
                device.id
            )));
        }
        debug!(device_id = %device.id, host, port, "SSH session established");
        Ok(Self { handle })
    }

    async fn session_channel(&self) -> Result<Channel<client::Msg>, TransportError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(map_ssh_error)
    }

    /// Run one command and collect its stdout
    pub async fn exec(&self, command: &str) -> Result<String, TransportError> {
        let mut channel = self.session_channel().await?;
        channel.exec(true, command).await.map_err(map_ssh_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        match exit_status {
            Some(0) | None => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Some(code) => Err(TransportError::protocol(format!(
                "'{command}' exited with {code}: {}",
                String::from_utf8_lossy(&stderr).trim()
            ))),
        }
    }

    /// Open an interactive shell and wait for the first prompt
    pub async fn shell(&self) -> Result<CliShell, TransportError> {
        let channel = self.session_channel().await?;
        channel
            .request_pty(true, "vt100", 512, 10_000, 0, 0, &[])
            .await
            .map_err(map_ssh_error)?;
        channel.request_shell(true).await.map_err(map_ssh_error)?;
        let mut shell = CliShell { channel };
        shell.read_to_prompt().await?;
        Ok(shell)
    }

    /// Download one file with the SCP source protocol
    pub async fn scp_download(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let mut channel = self.session_channel().await?;
        channel
            .exec(true, format!("scp -f {remote_path}"))
            .await
            .map_err(map_ssh_error)?;
        let mut stream = ChannelStream::new(&mut channel);

        stream.send(&[0]).await?;
        let header = stream.read_line().await?;
        let size = parse_scp_header(&header)?;
        stream.send(&[0]).await?;
        let body = stream.read_exact(size + 1).await?;
        stream.send(&[0]).await?;

        let (content, trailer) = body.split_at(size);
        if trailer != [0] {
            return Err(TransportError::protocol("SCP transfer not terminated"));
        }
        Ok(content.to_vec())
    }

    /// Upload one file with the SCP sink protocol
    pub async fn scp_upload(&self, remote_path: &str, content: &[u8]) -> Result<(), TransportError> {
        let mut channel = self.session_channel().await?;
        channel
            .exec(true, format!("scp -t {remote_path}"))
            .await
            .map_err(map_ssh_error)?;
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        let mut stream = ChannelStream::new(&mut channel);

        stream.expect_ack().await?;
        stream
            .send(format!("C0644 {} {name}\n", content.len()).as_bytes())
            .await?;
        stream.expect_ack().await?;
        stream.send(content).await?;
        stream.send(&[0]).await?;
        stream.expect_ack().await?;
        channel.eof().await.map_err(map_ssh_error)?;
        Ok(())
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// `C0644 <size> <name>`
fn parse_scp_header(header: &str) -> Result<usize, TransportError> {
    let header = header.trim_end();
    if let Some(message) = header.strip_prefix('\u{1}').or(header.strip_prefix('\u{2}')) {
        return Err(TransportError::protocol(format!("SCP error: {message}")));
    }
    let mut fields = header.splitn(3, ' ');
    match (fields.next(), fields.next()) {
        (Some(mode), Some(size)) if mode.starts_with('C') => size
            .parse()
            .map_err(|_| TransportError::protocol(format!("bad SCP size in '{header}'"))),
        _ => Err(TransportError::protocol(format!(
            "unexpected SCP header '{header}'"
        ))),
    }
}

/// Buffered reads over a channel's data messages
struct ChannelStream<'a> {
    channel: &'a mut Channel<client::Msg>,
    buffer: Vec<u8>,
}

impl<'a> ChannelStream<'a> {
    fn new(channel: &'a mut Channel<client::Msg>) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    self.buffer.extend_from_slice(&data);
                    return Ok(());
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(TransportError::protocol("channel closed mid-transfer"))
                }
                _ => {}
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await.map_err(map_ssh_error)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        while self.buffer.len() < len {
            self.fill().await?;
        }
        Ok(self.buffer.drain(..len).collect())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            self.fill().await?;
        }
    }

    async fn expect_ack(&mut self) -> Result<(), TransportError> {
        let ack = self.read_exact(1).await?;
        if ack[0] == 0 {
            return Ok(());
        }
        let message = self.read_line().await.unwrap_or_default();
        Err(TransportError::protocol(format!(
            "SCP refused: {}",
            message.trim()
        )))
    }
}

/// Interactive CLI over a PTY shell channel
pub struct CliShell {
    channel: Channel<client::Msg>,
}

impl CliShell {
    /// Read until the output ends in a prompt, paging through `--More--`
    async fn read_to_prompt(&mut self) -> Result<String, TransportError> {
        let mut output = String::new();
        let mut pages_answered = 0;
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    let pages = output.matches(PAGER_MARKER).count();
                    if pages > pages_answered {
                        pages_answered = pages;
                        self.channel.data(&b" "[..]).await.map_err(map_ssh_error)?;
                        continue;
                    }
                    let tail = output.rsplit('\n').next().unwrap_or_default();
                    if is_cli_prompt(tail) {
                        return Ok(output);
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(TransportError::protocol("shell closed before prompt"))
                }
                _ => {}
            }
        }
    }

    /// Send one command line and return everything up to the next prompt
    pub async fn command(&mut self, line: &str) -> Result<String, TransportError> {
        self.channel
            .data(format!("{line}\n").as_bytes())
            .await
            .map_err(map_ssh_error)?;
        self.read_to_prompt().await
    }
}

/// Interactive CLI export, e.g. `show full-configuration`
#[derive(Debug, Default, Clone)]
pub struct SshCliTransport;

impl SshCliTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackupTransport for SshCliTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::SshCli
    }

    async fn fetch_config(
        &self,
        device: &Device,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<RawConfig, TransportError> {
        let command = device
            .connection
            .options
            .fetch_command
            .as_deref()
            .unwrap_or(DEFAULT_FETCH_COMMAND);

        let connection = SshConnection::open(device, credential, timeout).await?;
        let result = async {
            let mut shell = connection.shell().await?;
            shell.command(command).await
        }
        .await;
        connection.close().await;

        let cleaned = clean_cli_output(&result?, command);
        if cleaned.is_empty() {
            return Err(TransportError::protocol(format!(
                "'{command}' returned no configuration"
            )));
        }
        Ok(RawConfig::new(cleaned))
    }

    fn pusher(&self) -> Option<&dyn ConfigPusher> {
        Some(self)
    }
}

#[async_trait]
impl ConfigPusher for SshCliTransport {
    async fn push_config(
        &self,
        device: &Device,
        credential: &Credential,
        content: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let connection = SshConnection::open(device, credential, timeout).await?;
        let result = async {
            let mut shell = connection.shell().await?;
            for (idx, line) in content.lines().enumerate() {
                let line = line.trim_end();
                if line.trim().is_empty() || line.trim_start().starts_with('#') {
                    continue;
                }
                let reply = shell.command(line).await?;
                if let Some(marker) = REJECTION_MARKERS.iter().find(|m| reply.contains(**m)) {
                    return Err(TransportError::protocol(format!(
                        "line {} rejected ({marker}): {}",
                        idx + 1,
                        line.trim()
                    )));
                }
            }
            Ok::<(), TransportError>(())
        }
        .await;
        connection.close().await;
        result
    }
}
