use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::states::JobState;

/// Errors returned by job and registry operations. None of these leave the
/// job in a changed state.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {number}: cannot start a job twice (state {state})")]
    AlreadyStarted { number: u64, state: JobState },
    #[error("job {number}: cannot finish a job that is not running (state {state})")]
    NotRunning { number: u64, state: JobState },
    #[error("job {number}: operation requires a NEW job (state {state})")]
    NotNew { number: u64, state: JobState },
    #[error("job {number}: already submitted")]
    AlreadySubmitted { number: u64 },
    #[error("job {number}: already finished (state {state})")]
    AlreadyFinished { number: u64, state: JobState },
    #[error("job {number}: not finished (state {state})")]
    NotFinished { number: u64, state: JobState },
    #[error("job {number}: kind {kind:?} does not support cancellation")]
    NotCancellable { number: u64, kind: String },
    #[error("job {0}: not known to this registry")]
    UnknownJob(u64),
    #[error("unknown job kind {0:?}")]
    UnknownKind(String),
    #[error("job kind {0:?} registered twice")]
    DuplicateKind(String),
    #[error("the registry must be started from within a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Resource errors raised while reading or writing persisted job records.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed job document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("job id {0:?} cannot be used as a file name")]
    InvalidJobId(String),
    #[error("persisted job {number} has unregistered kind {kind:?}")]
    UnknownKind { number: u64, kind: String },
}

/// A `{type, value}` pair that cannot be parsed back into a typed value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValueError {
    #[error("unknown value type {0:?}")]
    UnknownType(String),
    #[error("cannot parse {text:?} as {ty}")]
    BadText { ty: String, text: String },
    #[error("type {0} expects a scalar value")]
    ExpectedScalar(String),
    #[error("type {0} expects a list of values")]
    ExpectedArray(String),
}
