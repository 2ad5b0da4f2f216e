//! The job type registry: what each kind of job does and how it is treated.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::types::job::{Job, JobRecord};
use crate::types::value::Value;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// External representation of a job: property name to value.
pub type JobView = BTreeMap<String, Value>;

/// Adds kind-specific properties to a job's generic view.
pub type EnrichFn = Arc<dyn Fn(&JobRecord, &mut JobView) + Send + Sync>;

/// Materializes a job's parameters into a view.
pub type ParamsFn = Arc<dyn Fn(&JobRecord, ParamDirection, &mut JobView) + Send + Sync>;

/// Which parameters a parameter view should contain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamDirection {
    In,
    Out,
    Both,
}

impl ParamDirection {
    pub fn includes_inputs(self) -> bool {
        matches!(self, Self::In | Self::Both)
    }

    pub fn includes_outputs(self) -> bool {
        matches!(self, Self::Out | Self::Both)
    }
}

/// The work a kind of job performs.
///
/// The registry calls `process` exactly once per dispatch, after it has moved
/// the job to RUNNING. The processor must:
///
/// - reattach to the in-progress backend operation instead of starting a new
///   one if the job already has a backend jobid (it was recovered after a
///   restart);
/// - update progress and output parameters as it goes;
/// - poll `cancel` at safe points if its kind is cancellable, and call
///   [`Job::finish_terminate`] promptly once it is cancelled;
/// - end with exactly one of [`Job::finish_ok`], [`Job::finish_exception`] or
///   [`Job::finish_terminate`].
///
/// It must not call [`Job::start`].
pub trait JobProcessor: Send + Sync + 'static {
    fn process(&self, job: Arc<Job>, cancel: CancellationToken) -> BoxFuture;
}

impl<F, Fut> JobProcessor for F
where
    F: Fn(Arc<Job>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn process(&self, job: Arc<Job>, cancel: CancellationToken) -> BoxFuture {
        Box::pin(self(job, cancel))
    }
}

/// A registered category of job.
pub struct JobKind {
    name: String,
    processor: Arc<dyn JobProcessor>,
    cancellable: bool,
    persistent: bool,
    enrich: Option<EnrichFn>,
    params: Option<ParamsFn>,
}

impl JobKind {
    /// A kind that runs `processor`, is neither cancellable nor persisted.
    pub fn new<F, Fut>(name: impl Into<String>, processor: F) -> Self
    where
        F: Fn(Arc<Job>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_processor(name, processor)
    }

    pub fn with_processor(
        name: impl Into<String>,
        processor: impl JobProcessor,
    ) -> Self {
        Self {
            name: name.into(),
            processor: Arc::new(processor),
            cancellable: false,
            persistent: false,
            enrich: None,
            params: None,
        }
    }

    /// Declares that the processor honours cancellation requests.
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Declares that jobs of this kind are written to disk on every change.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_enrich(
        mut self,
        enrich: impl Fn(&JobRecord, &mut JobView) + Send + Sync + 'static,
    ) -> Self {
        self.enrich = Some(Arc::new(enrich));
        self
    }

    pub fn with_params_view(
        mut self,
        materialize: impl Fn(&JobRecord, ParamDirection, &mut JobView)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.params = Some(Arc::new(materialize));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn processor(&self) -> &Arc<dyn JobProcessor> {
        &self.processor
    }

    pub(crate) fn enrich_fn(&self) -> Option<&EnrichFn> {
        self.enrich.as_ref()
    }

    pub(crate) fn params_fn(&self) -> Option<&ParamsFn> {
        self.params.as_ref()
    }
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobKind")
            .field("name", &self.name)
            .field("cancellable", &self.cancellable)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// The table of job kinds, filled in before the registry starts.
///
/// [`Registry::start`](crate::registry::Registry::start) takes ownership of
/// the table, so no kind can be added once jobs can be created.
#[derive(Debug, Default)]
pub struct JobKinds {
    kinds: HashMap<String, Arc<JobKind>>,
}

impl JobKinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind) -> Result<(), JobError> {
        if self.kinds.contains_key(kind.name()) {
            return Err(JobError::DuplicateKind(kind.name().to_owned()));
        }
        self.kinds.insert(kind.name().to_owned(), Arc::new(kind));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<JobKind>> {
        self.kinds.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
