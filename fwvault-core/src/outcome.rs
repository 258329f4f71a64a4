//! Operator-facing result classification and exit codes.

use serde::Serialize;
use std::fmt;

use crate::device::DeviceId;
use crate::job::{Job, JobState};
use crate::VaultError;

/// Overall result of an operator command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some devices in a batch failed
    PartialFailure,
    TotalFailure,
    /// Restore rejected because the confirmation token did not match
    InvalidConfirmation,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TotalFailure => 1,
            Self::PartialFailure => 2,
            Self::InvalidConfirmation => 3,
        }
    }
}

impl From<&VaultError> for RunStatus {
    fn from(err: &VaultError) -> Self {
        match err {
            VaultError::Confirmation(_) => Self::InvalidConfirmation,
            _ => Self::TotalFailure,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::TotalFailure => "total failure",
            Self::InvalidConfirmation => "invalid confirmation",
        })
    }
}

/// Jobs produced by one trigger-all request
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Final records of the jobs that ran
    pub jobs: Vec<Job>,
    /// Devices passed over because they already had work in flight
    pub skipped: Vec<DeviceId>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.state == JobState::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.state != JobState::Succeeded)
    }

    /// Skipped devices are not failures
    pub fn status(&self) -> RunStatus {
        let ok = self.succeeded().count();
        let failed = self.jobs.len() - ok;
        match (ok, failed) {
            (_, 0) => RunStatus::Success,
            (0, _) => RunStatus::TotalFailure,
            _ => RunStatus::PartialFailure,
        }
    }
}
