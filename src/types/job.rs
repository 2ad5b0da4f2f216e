use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::event::{JobEvent, JobListener, Property};
use super::params::ParamBag;
use super::states::{ErrorType, JobState, StatusCode};
use super::value::Value;
use crate::clock::Clock;
use crate::error::JobError;
use crate::kind::{JobKind, JobView, ParamDirection};

pub const DEFAULT_PRIORITY: u32 = 128;
pub const DEFAULT_TIME_BEFORE_REMOVAL: Duration = Duration::from_secs(300);
pub const MIN_TIME_BEFORE_REMOVAL: Duration = Duration::from_secs(10);

/// Every persisted and externally observable field of a job.
///
/// This is what listeners see and what the persistence codec stores.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobRecord {
    /// Process-unique and never reused.
    pub number: u64,
    /// Name of the registered kind this job belongs to.
    pub kind: String,
    /// Backend-assigned identifier, if the backend has assigned one yet.
    pub jobid: Option<String>,
    pub name: Option<String>,
    pub method_name: Option<String>,
    pub state: JobState,
    /// Lower is more urgent. Advisory only.
    pub priority: u32,
    /// Unset until the job is handed to the registry to run.
    pub time_submitted: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub time_of_last_state_change: DateTime<Utc>,
    pub time_before_removal: Duration,
    pub delete_on_completion: bool,
    pub percent_complete: u8,
    pub status_code: StatusCode,
    pub error_type: ErrorType,
    /// Only ever set in the EXCEPTION state.
    pub error: Option<String>,
    /// Only ever set in the COMPLETED state.
    pub result: Option<Value>,
    pub in_params: ParamBag,
    pub out_params: ParamBag,
}

impl JobRecord {
    pub(crate) fn new(number: u64, kind: &str, now: DateTime<Utc>) -> Self {
        Self {
            number,
            kind: kind.to_owned(),
            jobid: None,
            name: None,
            method_name: None,
            state: JobState::New,
            priority: DEFAULT_PRIORITY,
            time_submitted: None,
            start_time: None,
            time_of_last_state_change: now,
            time_before_removal: DEFAULT_TIME_BEFORE_REMOVAL,
            delete_on_completion: true,
            percent_complete: 0,
            status_code: StatusCode::Ok,
            error_type: ErrorType::Unknown,
            error: None,
            result: None,
            in_params: ParamBag::new(),
            out_params: ParamBag::new(),
        }
    }

    /// The backend jobid, or the job number in decimal until one is assigned.
    pub fn effective_jobid(&self) -> String {
        self.jobid
            .clone()
            .unwrap_or_else(|| self.number.to_string())
    }

    /// True once the finished job has outlived its removal delay and may be
    /// evicted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.state.is_final() || !self.delete_on_completion {
            return false;
        }

        match (now - self.time_of_last_state_change).to_std() {
            Ok(elapsed) => elapsed > self.time_before_removal,
            Err(_) => false, // last change is in the future
        }
    }

    /// Generic external representation of the job's properties.
    pub fn to_view(&self) -> JobView {
        let mut view = JobView::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                view.insert(key.to_owned(), value);
            }
        };

        put("InstanceID", Some(self.effective_jobid().into()));
        put("JobNumber", Some(self.number.into()));
        put("JobKind", Some(self.kind.as_str().into()));
        put("Name", self.name.clone().map(Into::into));
        put("MethodName", self.method_name.clone().map(Into::into));
        put("JobState", Some(self.state.as_str().into()));
        put("Priority", Some(self.priority.into()));
        put("TimeSubmitted", self.time_submitted.map(Into::into));
        put("StartTime", self.start_time.map(Into::into));
        put(
            "TimeOfLastStateChange",
            Some(self.time_of_last_state_change.into()),
        );
        put(
            "TimeBeforeRemoval",
            Some(self.time_before_removal.as_secs().into()),
        );
        put("DeleteOnCompletion", Some(self.delete_on_completion.into()));
        put("PercentComplete", Some(u64::from(self.percent_complete).into()));
        put("StatusCode", Some(self.status_code.to_string().into()));
        put("ErrorDescription", self.error.clone().map(Into::into));

        view
    }
}

struct Inner {
    record: JobRecord,
    listeners: Vec<Arc<dyn JobListener>>,
    /// Backend-private scratch state.
    data: Option<Box<dyn Any + Send>>,
}

/// A trackable unit of asynchronous work.
///
/// Every accessor takes the job's own lock, so each call observes or applies
/// a consistent set of fields. Use [`Job::read`] to read several fields
/// atomically.
pub struct Job {
    kind: Arc<JobKind>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    finished: watch::Sender<bool>,
}

impl Job {
    pub(crate) fn new(number: u64, kind: Arc<JobKind>, clock: Arc<dyn Clock>) -> Self {
        let record = JobRecord::new(number, kind.name(), clock.now());
        Self::from_record(record, kind, clock)
    }

    pub(crate) fn from_record(
        record: JobRecord,
        kind: Arc<JobKind>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (finished, _) = watch::channel(record.state.is_final());
        Self {
            kind,
            clock,
            inner: Mutex::new(Inner {
                record,
                listeners: Vec::new(),
                data: None,
            }),
            finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking listener must not wedge the job.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a mutation and delivers whatever events it raised, all under
    /// the job's lock.
    fn update<R>(
        &self,
        f: impl FnOnce(&mut JobRecord, &mut Vec<JobEvent>) -> R,
    ) -> R {
        let mut inner = self.lock();
        let mut events = Vec::new();
        let ret = f(&mut inner.record, &mut events);

        if !events.is_empty() {
            for listener in &inner.listeners {
                listener.on_events(&inner.record, &events);
            }
            if events
                .iter()
                .any(|e| matches!(e, JobEvent::Finished { .. }))
            {
                self.finished.send_replace(true);
            }
        }

        ret
    }

    /// Sets a field, raising `Modified(property)` if the value changed.
    fn set_field<T: PartialEq>(
        &self,
        property: Property,
        value: T,
        field: fn(&mut JobRecord) -> &mut T,
    ) -> bool {
        self.update(|r, events| {
            let slot = field(r);
            if *slot == value {
                return false;
            }
            *slot = value;
            events.push(JobEvent::Modified(property));
            true
        })
    }

    /// As `set_field`, but rejected once the job is in a final state.
    fn set_live_field<T: PartialEq>(
        &self,
        property: Property,
        value: T,
        field: fn(&mut JobRecord) -> &mut T,
    ) -> Result<(), JobError> {
        self.update(|r, events| {
            reject_if_final(r, property)?;
            let slot = field(r);
            if *slot != value {
                *slot = value;
                events.push(JobEvent::Modified(property));
            }
            Ok(())
        })
    }

    /// Moves the job from `from` to `to`, letting `apply` update the other
    /// fields the new state implies and note which of them changed.
    fn transition(
        &self,
        from: JobState,
        to: JobState,
        apply: impl FnOnce(&mut JobRecord, DateTime<Utc>, &mut Vec<Property>),
    ) -> Result<(), JobError> {
        self.update(|r, events| {
            if r.state != from {
                let (number, state) = (r.number, r.state);
                let error = match (from, to) {
                    (JobState::New, JobState::Running) => {
                        JobError::AlreadyStarted { number, state }
                    },
                    (JobState::New, _) => JobError::NotNew { number, state },
                    _ => JobError::NotRunning { number, state },
                };
                warn!(job = number, %state, to = %to, %error, "rejected state transition");
                return Err(error);
            }

            let now = self.clock.now();
            let mut changed = vec![Property::State, Property::TimeOfLastStateChange];
            r.state = to;
            r.time_of_last_state_change = now;
            apply(r, now, &mut changed);

            if to.is_final() {
                let percent = if to == JobState::Completed { 100 } else { 0 };
                put(&mut r.percent_complete, percent, Property::PercentComplete, &mut changed);
            }

            events.push(JobEvent::StateChanged { old: from, new: to });
            events.extend(changed.into_iter().map(JobEvent::Modified));
            if to.is_final() {
                events.push(JobEvent::Finished {
                    old: from,
                    new: to,
                    result: r.result.clone(),
                    error: r.error.clone(),
                });
            }

            debug!(job = r.number, kind = %r.kind, old = %from, new = %to, "state changed");
            Ok(())
        })
    }

    /// NEW -> RUNNING. Records the start time.
    pub fn start(&self) -> Result<(), JobError> {
        self.transition(JobState::New, JobState::Running, |r, now, changed| {
            r.start_time = Some(now);
            changed.push(Property::StartTime);
        })
    }

    /// RUNNING -> COMPLETED with the given result.
    pub fn finish_ok(&self, result: impl Into<Value>) -> Result<(), JobError> {
        let result = result.into();
        self.transition(JobState::Running, JobState::Completed, |r, _, changed| {
            put(&mut r.result, Some(result), Property::Result, changed);
        })
    }

    /// RUNNING -> EXCEPTION, recording the status code and error message.
    pub fn finish_exception(
        &self,
        code: StatusCode,
        message: impl Into<String>,
    ) -> Result<(), JobError> {
        let message = message.into();
        self.transition(JobState::Running, JobState::Exception, |r, _, changed| {
            put(&mut r.status_code, code, Property::StatusCode, changed);
            put(&mut r.error, Some(message), Property::Error, changed);
        })
    }

    /// RUNNING -> TERMINATED, in response to a cancellation request.
    pub fn finish_terminate(&self) -> Result<(), JobError> {
        self.transition(JobState::Running, JobState::Terminated, |_, _, _| {})
    }

    /// NEW -> TERMINATED: kills a job that never started.
    pub fn abort(&self) -> Result<(), JobError> {
        self.transition(JobState::New, JobState::Terminated, |_, _, _| {})
    }

    /// Stamps the submission time. Only the registry submits jobs.
    pub(crate) fn mark_submitted(&self) -> Result<(), JobError> {
        let now = self.clock.now();
        self.update(|r, events| {
            if r.state != JobState::New {
                return Err(JobError::NotNew {
                    number: r.number,
                    state: r.state,
                });
            }
            if r.time_submitted.is_some() {
                return Err(JobError::AlreadySubmitted { number: r.number });
            }
            r.time_submitted = Some(now);
            events.push(JobEvent::Modified(Property::TimeSubmitted));
            Ok(())
        })
    }

    /// Resolves once the job reaches a final state, returning that state.
    ///
    /// Must not be awaited from inside a listener of this job.
    pub async fn wait_finished(&self) -> JobState {
        let mut rx = self.finished.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
        self.state()
    }

    pub fn subscribe(&self, listener: Arc<dyn JobListener>) {
        self.lock().listeners.push(listener);
    }

    /// Reads several fields under a single acquisition of the job's lock.
    pub fn read<R>(&self, f: impl FnOnce(&JobRecord) -> R) -> R {
        f(&self.lock().record)
    }

    pub fn snapshot(&self) -> JobRecord {
        self.read(|r| r.clone())
    }

    pub fn number(&self) -> u64 {
        self.read(|r| r.number)
    }

    pub fn kind(&self) -> &str {
        self.kind.name()
    }

    pub(crate) fn job_kind(&self) -> &Arc<JobKind> {
        &self.kind
    }

    /// The backend jobid, defaulting to the job number in decimal.
    pub fn jobid(&self) -> String {
        self.read(JobRecord::effective_jobid)
    }

    /// True if a processing callback has assigned a backend jobid, i.e. a
    /// backend operation may already be in progress for this job.
    pub fn has_backend_jobid(&self) -> bool {
        self.read(|r| r.jobid.is_some())
    }

    pub fn set_jobid(&self, jobid: impl Into<String>) -> Result<(), JobError> {
        self.set_live_field(Property::JobId, Some(jobid.into()), |r| &mut r.jobid)
    }

    pub fn name(&self) -> Option<String> {
        self.read(|r| r.name.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) -> bool {
        self.set_field(Property::Name, Some(name.into()), |r| &mut r.name)
    }

    pub fn method_name(&self) -> Option<String> {
        self.read(|r| r.method_name.clone())
    }

    pub fn set_method_name(&self, method: impl Into<String>) -> Result<(), JobError> {
        self.set_live_field(Property::MethodName, Some(method.into()), |r| {
            &mut r.method_name
        })
    }

    pub fn state(&self) -> JobState {
        self.read(|r| r.state)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_final()
    }

    pub fn priority(&self) -> u32 {
        self.read(|r| r.priority)
    }

    pub fn set_priority(&self, priority: u32) -> bool {
        self.update(|r, events| {
            let old = r.priority;
            if old == priority {
                return false;
            }
            r.priority = priority;
            events.push(JobEvent::Modified(Property::Priority));
            events.push(JobEvent::PriorityChanged { old, new: priority });
            true
        })
    }

    pub fn time_submitted(&self) -> Option<DateTime<Utc>> {
        self.read(|r| r.time_submitted)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.read(|r| r.start_time)
    }

    pub fn time_of_last_state_change(&self) -> DateTime<Utc> {
        self.read(|r| r.time_of_last_state_change)
    }

    pub fn time_before_removal(&self) -> Duration {
        self.read(|r| r.time_before_removal)
    }

    /// Sets how long a finished job is kept, never less than
    /// [`MIN_TIME_BEFORE_REMOVAL`].
    pub fn set_time_before_removal(&self, delay: Duration) -> bool {
        let delay = delay.max(MIN_TIME_BEFORE_REMOVAL);
        self.update(|r, events| {
            if r.time_before_removal == delay {
                return false;
            }
            r.time_before_removal = delay;
            events.push(JobEvent::Modified(Property::TimeBeforeRemoval));
            events.push(JobEvent::DeletionPolicyChanged);
            true
        })
    }

    pub fn delete_on_completion(&self) -> bool {
        self.read(|r| r.delete_on_completion)
    }

    pub fn set_delete_on_completion(&self, delete: bool) -> bool {
        self.update(|r, events| {
            if r.delete_on_completion == delete {
                return false;
            }
            r.delete_on_completion = delete;
            events.push(JobEvent::Modified(Property::DeleteOnCompletion));
            events.push(JobEvent::DeletionPolicyChanged);
            true
        })
    }

    pub fn percent_complete(&self) -> u8 {
        self.read(|r| r.percent_complete)
    }

    /// Sets progress, clamped to 100.
    pub fn set_percent_complete(&self, percent: u8) -> Result<(), JobError> {
        self.set_live_field(Property::PercentComplete, percent.min(100), |r| {
            &mut r.percent_complete
        })
    }

    /// Updates progress and output parameters in one step.
    pub fn report_progress<K, V>(
        &self,
        percent: u8,
        outputs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), JobError>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.update(|r, events| {
            reject_if_final(r, Property::PercentComplete)?;

            let percent = percent.min(100);
            if r.percent_complete != percent {
                r.percent_complete = percent;
                events.push(JobEvent::Modified(Property::PercentComplete));
            }

            let mut outputs = outputs.into_iter().peekable();
            if outputs.peek().is_some() {
                for (k, v) in outputs {
                    r.out_params.set(k.as_ref(), v.into());
                }
                events.push(JobEvent::Modified(Property::OutParams));
            }
            Ok(())
        })
    }

    pub fn status_code(&self) -> StatusCode {
        self.read(|r| r.status_code)
    }

    pub fn error_type(&self) -> ErrorType {
        self.read(|r| r.error_type)
    }

    pub fn set_error_type(&self, error_type: ErrorType) -> Result<(), JobError> {
        self.set_live_field(Property::ErrorType, error_type, |r| &mut r.error_type)
    }

    pub fn error(&self) -> Option<String> {
        self.read(|r| r.error.clone())
    }

    pub fn result(&self) -> Option<Value> {
        self.read(|r| r.result.clone())
    }

    pub fn set_in_param(
        &self,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), JobError> {
        let value = value.into();
        self.update(|r, events| {
            reject_if_final(r, Property::InParams)?;
            r.in_params.set(key, value);
            events.push(JobEvent::Modified(Property::InParams));
            Ok(())
        })
    }

    pub fn get_in_param(&self, key: &str) -> Option<Value> {
        self.read(|r| r.in_params.get(key).cloned())
    }

    pub fn has_in_param(&self, key: &str) -> bool {
        self.read(|r| r.in_params.contains(key))
    }

    pub fn set_out_param(
        &self,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), JobError> {
        let value = value.into();
        self.update(|r, events| {
            reject_if_final(r, Property::OutParams)?;
            r.out_params.set(key, value);
            events.push(JobEvent::Modified(Property::OutParams));
            Ok(())
        })
    }

    pub fn get_out_param(&self, key: &str) -> Option<Value> {
        self.read(|r| r.out_params.get(key).cloned())
    }

    pub fn has_out_param(&self, key: &str) -> bool {
        self.read(|r| r.out_params.contains(key))
    }

    /// Replaces the backend-private data, dropping any previous value.
    pub fn set_data<T: Any + Send>(&self, data: T) {
        let old = self.lock().data.replace(Box::new(data));
        drop(old);
    }

    /// Runs `f` on the backend-private data if it holds a `T`.
    pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock()
            .data
            .as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }

    /// Removes and returns the backend-private data if it holds a `T`.
    pub fn take_data<T: Any + Send>(&self) -> Option<T> {
        let mut inner = self.lock();
        match inner.data.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                inner.data = Some(other);
                None
            },
        }
    }

    /// External representation of the job, enriched by its kind.
    pub fn view(&self) -> JobView {
        let inner = self.lock();
        let mut view = inner.record.to_view();
        if let Some(enrich) = self.kind.enrich_fn() {
            enrich(&inner.record, &mut view);
        }
        view
    }

    /// External representation of the job's parameters.
    pub fn params_view(&self, direction: ParamDirection) -> JobView {
        let inner = self.lock();
        let mut view = JobView::new();
        match self.kind.params_fn() {
            Some(materialize) => materialize(&inner.record, direction, &mut view),
            None => {
                let record = &inner.record;
                if direction.includes_inputs() {
                    view.extend(record.in_params.iter().map(|(k, v)| (k.to_owned(), v.clone())));
                }
                if direction.includes_outputs() {
                    view.extend(record.out_params.iter().map(|(k, v)| (k.to_owned(), v.clone())));
                }
            },
        }
        view
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (number, state) = self.read(|r| (r.number, r.state));
        f.debug_struct("Job")
            .field("number", &number)
            .field("kind", &self.kind.name())
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

fn put<T: PartialEq>(slot: &mut T, value: T, property: Property, changed: &mut Vec<Property>) {
    if *slot != value {
        *slot = value;
        changed.push(property);
    }
}

fn reject_if_final(r: &JobRecord, property: Property) -> Result<(), JobError> {
    if r.state.is_final() {
        warn!(job = r.number, state = %r.state, ?property, "job is finished, field is read-only");
        return Err(JobError::AlreadyFinished {
            number: r.number,
            state: r.state,
        });
    }
    Ok(())
}
