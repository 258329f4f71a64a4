/*!
Programmable in-memory transport for dry runs and tests.

Each device has a script of steps consumed one per fetch, and a "live"
configuration returned once the script is exhausted. A successful push
replaces the live configuration, so a fetch after a restore observes the
restored content.
*/

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{BackupTransport, ConfigPusher, RawConfig};
use crate::credential::Credential;
use crate::device::{Device, DeviceId, TransportMethod};
use crate::error::TransportError;

/// One scripted fetch outcome
#[derive(Debug, Clone)]
pub enum Step {
    Config(String),
    Fail(TransportError),
    /// Never completes; the caller's timeout has to fire
    Hang,
    /// Completes with the live configuration after a delay
    Delay(Duration),
}

#[derive(Default)]
struct DeviceScript {
    steps: VecDeque<Step>,
    live: Option<String>,
    push_error: Option<TransportError>,
    /// Left live when a failing push dies midway
    partial_apply: Option<String>,
}

/// Scripted transport; see the module docs
pub struct ScriptedTransport {
    method: TransportMethod,
    devices: Mutex<HashMap<DeviceId, DeviceScript>>,
    pushes: Mutex<Vec<(DeviceId, String)>>,
    fetches: AtomicUsize,
    push_capable: bool,
}

impl ScriptedTransport {
    pub fn new(method: TransportMethod) -> Self {
        Self {
            method,
            devices: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            push_capable: true,
        }
    }

    /// Fetch-only variant, like a manager-proxied transport
    pub fn read_only(mut self) -> Self {
        self.push_capable = false;
        self
    }

    fn with_device<R>(&self, id: &DeviceId, f: impl FnOnce(&mut DeviceScript) -> R) -> R {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        f(devices.entry(id.clone()).or_default())
    }

    /// Configuration returned when no scripted step is pending
    pub fn set_live<S: Into<String>>(&self, id: &DeviceId, content: S) {
        let content = content.into();
        self.with_device(id, |d| d.live = Some(content));
    }

    pub fn live(&self, id: &DeviceId) -> Option<String> {
        self.with_device(id, |d| d.live.clone())
    }

    pub fn push_step(&self, id: &DeviceId, step: Step) {
        self.with_device(id, |d| d.steps.push_back(step));
    }

    pub fn fail_pushes(&self, id: &DeviceId, error: TransportError) {
        self.with_device(id, |d| d.push_error = Some(error));
    }

    /// Fail pushes after leaving `applied` live, as a session dropped mid-paste would
    pub fn fail_pushes_partway<S: Into<String>>(&self, id: &DeviceId, applied: S, error: TransportError) {
        let applied = applied.into();
        self.with_device(id, |d| {
            d.push_error = Some(error);
            d.partial_apply = Some(applied);
        });
    }

    /// Total fetch calls across all devices
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Every successful push, in call order
    pub fn pushes(&self) -> Vec<(DeviceId, String)> {
        self.pushes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BackupTransport for ScriptedTransport {
    fn method(&self) -> TransportMethod {
        self.method
    }

    async fn fetch_config(
        &self,
        device: &Device,
        _credential: &Credential,
        _timeout: Duration,
    ) -> Result<RawConfig, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (step, live) = self.with_device(&device.id, |d| (d.steps.pop_front(), d.live.clone()));
        let live = || {
            live.clone().map(RawConfig::new).ok_or_else(|| {
                TransportError::unreachable(format!("no scripted configuration for {}", device.id))
            })
        };

        match step {
            Some(Step::Config(content)) => Ok(RawConfig::new(content)),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => futures::future::pending().await,
            Some(Step::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                live()
            }
            None => live(),
        }
    }

    fn pusher(&self) -> Option<&dyn ConfigPusher> {
        self.push_capable.then_some(self as &dyn ConfigPusher)
    }
}

#[async_trait]
impl ConfigPusher for ScriptedTransport {
    async fn push_config(
        &self,
        device: &Device,
        _credential: &Credential,
        content: &str,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let failure = self.with_device(&device.id, |d| {
            let error = d.push_error.clone()?;
            if let Some(applied) = d.partial_apply.clone() {
                d.live = Some(applied);
            }
            Some(error)
        });
        if let Some(error) = failure {
            return Err(error);
        }
        self.set_live(&device.id, content);
        self.pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device.id.clone(), content.to_string()));
        Ok(())
    }
}
