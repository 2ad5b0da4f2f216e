use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// ```text
/// NEW --start--> RUNNING --finish_ok--------> COMPLETED
///  |                     --finish_exception-> EXCEPTION
///  |                     --finish_terminate-> TERMINATED
///  +--abort--------------------------------> TERMINATED
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    New,
    Running,
    Completed,
    Terminated,
    Exception,
}

impl JobState {
    /// Final states are sticky: no transition leaves them.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Exception)
    }

    pub fn as_str(self) -> &'static str {
        use JobState::*;

        match self {
            New => "NEW",
            Running => "RUNNING",
            Completed => "COMPLETED",
            Terminated => "TERMINATED",
            Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Management-protocol style status code reported for a finished job.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    #[default]
    Ok,
    Failed,
    AccessDenied,
    InvalidParameter,
    NotFound,
    NotSupported,
    AlreadyExists,
    MethodNotAvailable,
    Timeout,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use StatusCode::*;

        f.write_str(match self {
            Ok => "ok",
            Failed => "failed",
            AccessDenied => "access denied",
            InvalidParameter => "invalid parameter",
            NotFound => "not found",
            NotSupported => "not supported",
            AlreadyExists => "already exists",
            MethodNotAvailable => "method not available",
            Timeout => "timeout",
        })
    }
}

/// Broad category of the failure recorded on a job in the EXCEPTION state.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    #[default]
    Unknown,
    Other,
    CommunicationsError,
    QualityOfServiceError,
    SoftwareError,
    HardwareError,
    EnvironmentalError,
    SecurityError,
    OversubscriptionError,
    UnavailableResourceError,
    UnsupportedOperationError,
}
