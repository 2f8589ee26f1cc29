//! Exit status mapping.

use std::process::ExitCode;

use strata_core::consolidation::RunStatus;
use strata_core::{RunReport, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CliExitCode {
    /// The run finished. Zero candidates is still success.
    Success = 0,
    /// Precondition failure, concurrent run, or store failure.
    Failure = 1,
    /// The configuration cannot be used.
    Config = 2,
}

impl From<CliExitCode> for ExitCode {
    fn from(code: CliExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

impl From<&StrataError> for CliExitCode {
    fn from(err: &StrataError) -> Self {
        match err {
            StrataError::Configuration(_) | StrataError::Validation { .. } => CliExitCode::Config,
            _ => CliExitCode::Failure,
        }
    }
}

impl From<&RunReport> for CliExitCode {
    fn from(report: &RunReport) -> Self {
        match report.status {
            RunStatus::Failed => CliExitCode::Failure,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Running => {
                CliExitCode::Success
            }
        }
    }
}
