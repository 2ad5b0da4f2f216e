use super::job::JobRecord;
use super::states::JobState;
use super::value::Value;

/// A job field whose change is reported through [`JobEvent::Modified`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Property {
    JobId,
    Name,
    MethodName,
    State,
    Priority,
    TimeSubmitted,
    StartTime,
    TimeOfLastStateChange,
    TimeBeforeRemoval,
    DeleteOnCompletion,
    PercentComplete,
    StatusCode,
    ErrorType,
    Error,
    Result,
    InParams,
    OutParams,
}

/// Notifications emitted by a job, in the order they were raised.
///
/// A state change emits `StateChanged`, then one `Modified` per changed
/// field, then `Finished` if the new state is final.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Modified(Property),
    StateChanged {
        old: JobState,
        new: JobState,
    },
    Finished {
        old: JobState,
        new: JobState,
        result: Option<Value>,
        error: Option<String>,
    },
    PriorityChanged {
        old: u32,
        new: u32,
    },
    /// Either `delete_on_completion` or `time_before_removal` changed.
    DeletionPolicyChanged,
}

/// Observer of a single job.
///
/// Called synchronously with the job's lock held, once per mutation, with
/// every event that mutation raised. Implementations must not block and must
/// not call back into the job they observe.
pub trait JobListener: Send + Sync {
    fn on_events(&self, job: &JobRecord, events: &[JobEvent]);
}

impl<F> JobListener for F
where
    F: Fn(&JobRecord, &[JobEvent]) + Send + Sync,
{
    fn on_events(&self, job: &JobRecord, events: &[JobEvent]) {
        self(job, events)
    }
}
