//! The job registry: owns every live job, numbers them, and runs them under
//! the configured execution policy.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ExecutionPolicy, RegistryConfig};
use crate::error::JobError;
use crate::kind::JobKinds;
use crate::persist::{JobStore, Persister};
use crate::types::job::Job;
use crate::types::states::{ErrorType, JobState, StatusCode};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    job: Arc<Job>,
    /// Cancelled by `terminate_job`; handed to the job's processor.
    cancel: CancellationToken,
}

#[derive(Default)]
struct Table {
    jobs: BTreeMap<u64, Entry>,
    /// Submitted jobs waiting for a worker, in submission order.
    pending: VecDeque<u64>,
    /// Jobs that hold a worker.
    running: BTreeSet<u64>,
}

/// A job that has been given a worker slot and is about to be launched.
struct Dispatch {
    job: Arc<Job>,
    cancel: CancellationToken,
    /// Recovered RUNNING jobs go straight to their processor.
    resumed: bool,
}

struct Shared {
    kinds: JobKinds,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    next_number: AtomicU64,
    table: Mutex<Table>,
    store: Option<Arc<JobStore>>,
    runtime: Handle,
    workers: TaskTracker,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the job registry. Clones share the same registry.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Starts the registry: opens the persistence directory, recovers any
    /// jobs persisted there, and starts the eviction sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(kinds: JobKinds, config: RegistryConfig) -> Result<Self, JobError> {
        Self::start_with_clock(kinds, config, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        kinds: JobKinds,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, JobError> {
        let runtime = Handle::try_current().map_err(|_| JobError::NoRuntime)?;
        let store = config
            .persistence_dir()
            .map(JobStore::open)
            .transpose()?
            .map(Arc::new);

        let registry = Self {
            shared: Arc::new(Shared {
                kinds,
                config,
                clock,
                next_number: AtomicU64::new(1),
                table: Mutex::new(Table::default()),
                store,
                runtime,
                workers: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        };

        registry.recover()?;
        registry.spawn_sweeper();

        info!(
            policy = ?registry.shared.config.policy,
            profile = %registry.shared.config.profile,
            kinds = registry.shared.kinds.len(),
            jobs = registry.lock().jobs.len(),
            "job registry started"
        );
        Ok(registry)
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn kinds(&self) -> &JobKinds {
        &self.shared.kinds
    }

    /// Creates a NEW job of a registered kind. The caller sets its method
    /// name and input parameters, then hands it to [`Registry::run_job`].
    pub fn new_job(&self, kind: &str) -> Result<Arc<Job>, JobError> {
        let kind = self
            .shared
            .kinds
            .get(kind)
            .ok_or_else(|| JobError::UnknownKind(kind.to_owned()))?;

        let number = self.shared.next_number.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::new(
            number,
            Arc::clone(kind),
            Arc::clone(&self.shared.clock),
        ));
        self.attach_store(&job);
        if let Some(store) = self.store_for(&job) {
            if let Err(error) = store.save(&job.snapshot()) {
                error!(job = number, %error, "failed to persist new job");
            }
        }

        self.lock().jobs.insert(
            number,
            Entry {
                job: Arc::clone(&job),
                cancel: CancellationToken::new(),
            },
        );
        debug!(job = number, kind = kind.name(), "created job");
        Ok(job)
    }

    fn store_for(&self, job: &Job) -> Option<&Arc<JobStore>> {
        self.shared
            .store
            .as_ref()
            .filter(|_| job.job_kind().is_persistent())
    }

    fn attach_store(&self, job: &Job) {
        if let Some(store) = self.store_for(job) {
            job.subscribe(Arc::new(Persister::new(Arc::clone(store))));
        }
    }

    /// Submits a NEW job for execution.
    ///
    /// Under the concurrent policy the job starts at once. Under the
    /// serialized policy it joins the back of the pending queue and starts
    /// once every job ahead of it has finished. Priority plays no part.
    pub fn run_job(&self, job: &Arc<Job>) -> Result<(), JobError> {
        let number = job.number();
        if !self.lock().jobs.contains_key(&number) {
            warn!(job = number, "cannot run a job this registry does not hold");
            return Err(JobError::UnknownJob(number));
        }

        if let Err(error) = job.mark_submitted() {
            warn!(job = number, %error, "cannot submit job");
            return Err(error);
        }
        let next = self.enqueue(number);
        self.launch(next);
        Ok(())
    }

    fn enqueue(&self, number: u64) -> Option<Dispatch> {
        let mut table = self.lock();
        match self.shared.config.policy {
            ExecutionPolicy::Concurrent => {
                let entry = table.jobs.get(&number)?;
                let dispatch = Dispatch {
                    job: Arc::clone(&entry.job),
                    cancel: entry.cancel.clone(),
                    resumed: false,
                };
                table.running.insert(number);
                Some(dispatch)
            },
            ExecutionPolicy::Serialized => {
                table.pending.push_back(number);
                debug!(job = number, queued = table.pending.len(), "job queued");
                Self::next_serialized(&mut table)
            },
        }
    }

    /// Claims the worker slot for the next pending job, if the slot is free.
    fn next_serialized(table: &mut Table) -> Option<Dispatch> {
        if !table.running.is_empty() {
            return None;
        }
        while let Some(number) = table.pending.pop_front() {
            let Some(entry) = table.jobs.get(&number) else {
                continue;
            };
            let dispatch = Dispatch {
                job: Arc::clone(&entry.job),
                cancel: entry.cancel.clone(),
                resumed: false,
            };
            table.running.insert(number);
            return Some(dispatch);
        }
        None
    }

    /// Gives up a job's worker slot, returning the job that takes it over.
    fn release_slot(&self, number: u64) -> Option<Dispatch> {
        let mut table = self.lock();
        table.running.remove(&number);
        match self.shared.config.policy {
            ExecutionPolicy::Concurrent => None,
            ExecutionPolicy::Serialized => Self::next_serialized(&mut table),
        }
    }

    fn launch(&self, mut next: Option<Dispatch>) {
        while let Some(Dispatch {
            job,
            cancel,
            resumed,
        }) = next.take()
        {
            // The registry owns the NEW -> RUNNING edge.
            if !resumed {
                if let Err(error) = job.start() {
                    warn!(job = job.number(), %error, "not dispatching job");
                    next = self.release_slot(job.number());
                    continue;
                }
            }

            let registry = self.clone();
            self.shared.workers.spawn_on(
                async move { registry.work(job, cancel).await },
                &self.shared.runtime,
            );
        }
    }

    #[instrument(name = "work", skip_all, fields(job = job.number(), kind = job.kind()))]
    async fn work(self, job: Arc<Job>, cancel: CancellationToken) {
        let number = job.number();
        debug!(reattach = job.has_backend_jobid(), "processing job");

        let processing = job
            .job_kind()
            .processor()
            .process(Arc::clone(&job), cancel.clone());
        // Run the processor as its own task so a panic in it is contained.
        if let Err(error) = self.shared.runtime.spawn(processing).await {
            error!(%error, "processing callback failed");
        }

        if !job.is_finished() {
            if cancel.is_cancelled() {
                warn!("processing callback returned without finishing a cancelled job");
                let _ = job.finish_terminate();
            } else {
                error!("processing callback returned without finishing the job");
                let _ = job.set_error_type(ErrorType::SoftwareError);
                let _ = job.finish_exception(
                    StatusCode::Failed,
                    "processing callback returned without finishing the job",
                );
            }
        }
        info!(state = %job.state(), "job finished");

        let next = self.release_slot(number);
        self.launch(next);
    }

    pub fn get_job_by_number(&self, number: u64) -> Option<Arc<Job>> {
        self.lock()
            .jobs
            .get(&number)
            .map(|entry| Arc::clone(&entry.job))
    }

    /// Finds a job by its backend jobid (or its number, if it has none).
    pub fn get_job_by_id(&self, jobid: &str) -> Option<Arc<Job>> {
        self.all_jobs().into_iter().find(|job| job.jobid() == jobid)
    }

    /// Finds the lowest-numbered job with this name.
    pub fn get_job_by_name(&self, name: &str) -> Option<Arc<Job>> {
        self.all_jobs()
            .into_iter()
            .find(|job| job.name().as_deref() == Some(name))
    }

    fn all_jobs(&self) -> Vec<Arc<Job>> {
        self.lock()
            .jobs
            .values()
            .map(|entry| Arc::clone(&entry.job))
            .collect()
    }

    pub fn list_job_numbers(&self) -> Vec<u64> {
        self.lock().jobs.keys().copied().collect()
    }

    /// Submitted jobs still waiting for a worker, in dispatch order.
    pub fn list_pending_job_numbers(&self) -> Vec<u64> {
        self.lock().pending.iter().copied().collect()
    }

    /// Jobs currently holding a worker.
    pub fn list_running_job_numbers(&self) -> Vec<u64> {
        self.lock().running.iter().copied().collect()
    }

    /// Removes a finished job and its persisted document.
    pub fn delete_job(&self, job: &Arc<Job>) -> Result<(), JobError> {
        let (number, state) = job.read(|r| (r.number, r.state));
        if !state.is_final() {
            warn!(job = number, %state, "cannot delete a job that has not finished");
            return Err(JobError::NotFinished { number, state });
        }

        if self.lock().jobs.remove(&number).is_none() {
            return Err(JobError::UnknownJob(number));
        }
        self.forget(number);
        debug!(job = number, "deleted job");
        Ok(())
    }

    fn forget(&self, number: u64) {
        if let Some(store) = &self.shared.store {
            if let Err(error) = store.remove(number) {
                error!(job = number, %error, "failed to remove persisted job");
            }
        }
    }

    /// Requests cancellation of a job whose kind supports it.
    ///
    /// A job that has not started yet is removed from the pending queue and
    /// moved straight to TERMINATED. A running job's processor is signalled
    /// and this returns without waiting for it to react.
    pub fn terminate_job(&self, job: &Arc<Job>) -> Result<(), JobError> {
        let (number, state) = job.read(|r| (r.number, r.state));
        if !job.job_kind().is_cancellable() {
            warn!(job = number, kind = job.kind(), "job kind is not cancellable");
            return Err(JobError::NotCancellable {
                number,
                kind: job.kind().to_owned(),
            });
        }
        if state.is_final() {
            return Err(JobError::AlreadyFinished { number, state });
        }

        let cancel = {
            let mut table = self.lock();
            let entry = table.jobs.get(&number).ok_or(JobError::UnknownJob(number))?;
            let cancel = entry.cancel.clone();

            if let Some(pos) = table.pending.iter().position(|&n| n == number) {
                table.pending.remove(pos);
                None
            } else if table.running.contains(&number) {
                Some(cancel)
            } else {
                None
            }
        };

        match cancel {
            Some(cancel) => {
                info!(job = number, "requesting job cancellation");
                cancel.cancel();
                Ok(())
            },
            None => {
                info!(job = number, "terminating job before start");
                job.abort()
            },
        }
    }

    /// Removes finished jobs whose removal delay has elapsed, returning their
    /// numbers.
    pub fn evict_expired(&self) -> Vec<u64> {
        let now = self.shared.clock.now();
        let evicted: Vec<u64> = {
            let mut table = self.lock();
            let expired: Vec<u64> = table
                .jobs
                .iter()
                .filter(|(_, entry)| entry.job.read(|r| r.is_expired(now)))
                .map(|(&number, _)| number)
                .collect();
            for number in &expired {
                table.jobs.remove(number);
            }
            expired
        };

        for &number in &evicted {
            self.forget(number);
            debug!(job = number, "evicted expired job");
        }
        evicted
    }

    fn spawn_sweeper(&self) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let period = self.shared.config.sweep_interval.max(MIN_SWEEP_INTERVAL);

        let handle = self.shared.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = ticker.tick() => {},
                    _ = shutdown.cancelled() => break,
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                Registry { shared }.evict_expired();
            }
        });

        *self
            .shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Reloads persisted jobs: RUNNING ones go back to their processor,
    /// submitted NEW ones are queued again, the rest are kept for lookup.
    fn recover(&self) -> Result<(), JobError> {
        let Some(store) = &self.shared.store else {
            return Ok(());
        };

        let mut resume = Vec::new();
        let mut requeue = Vec::new();
        for record in store.load_all()? {
            let number = record.number;
            let Some(next) = number.checked_add(1) else {
                warn!(job = number, "skipping persisted job with an out-of-range number");
                continue;
            };
            // Even skipped documents keep their number, and so their file.
            self.shared.next_number.fetch_max(next, Ordering::Relaxed);
            let Some(kind) = self.shared.kinds.get(&record.kind) else {
                warn!(job = number, kind = %record.kind, "skipping persisted job of unregistered kind");
                continue;
            };
            if self.lock().jobs.contains_key(&number) {
                warn!(job = number, "skipping duplicate persisted job");
                continue;
            }

            let (state, submitted) = (record.state, record.time_submitted.is_some());
            let job = Arc::new(Job::from_record(
                record,
                Arc::clone(kind),
                Arc::clone(&self.shared.clock),
            ));
            self.attach_store(&job);
            self.lock().jobs.insert(
                number,
                Entry {
                    job,
                    cancel: CancellationToken::new(),
                },
            );

            match state {
                JobState::Running => resume.push(number),
                JobState::New if submitted => requeue.push(number),
                _ => {},
            }
        }
        info!(resumed = resume.len(), requeued = requeue.len(), "recovered persisted jobs");

        for number in resume {
            let dispatch = {
                let mut table = self.lock();
                table.running.insert(number);
                table.jobs.get(&number).map(|entry| Dispatch {
                    job: Arc::clone(&entry.job),
                    cancel: entry.cancel.clone(),
                    resumed: true,
                })
            };
            self.launch(dispatch);
        }
        for number in requeue {
            let next = self.enqueue(number);
            self.launch(next);
        }
        Ok(())
    }

    /// Waits until no job holds a worker.
    pub async fn wait_idle(&self) {
        let workers = &self.shared.workers;
        workers.close();
        workers.wait().await;
        workers.reopen();
    }

    /// Stops the eviction sweep and waits for it to exit. Running jobs are
    /// left alone; persisted writes happen synchronously, so none are in
    /// flight once this returns.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let sweeper = self
            .shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if let Err(error) = sweeper.await {
                error!(%error, "eviction sweep failed");
            }
        }
        info!("job registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::kind::JobKind;
    use crate::persist;
    use crate::types::job::JobRecord;
    use crate::types::value::Value;

    fn serialized() -> RegistryConfig {
        RegistryConfig {
            policy: ExecutionPolicy::Serialized,
            ..Default::default()
        }
    }

    fn persisted(dir: &TempDir) -> RegistryConfig {
        RegistryConfig {
            persistence_root: Some(dir.path().to_owned()),
            profile: "software".into(),
            ..Default::default()
        }
    }

    /// A kind whose jobs block until `gate` opens, then complete.
    fn gated(name: &str, gate: CancellationToken) -> JobKind {
        JobKind::new(name, move |job: Arc<Job>, _cancel| {
            let gate = gate.clone();
            async move {
                gate.cancelled().await;
                job.finish_ok(0u64).unwrap();
            }
        })
    }

    fn kinds(list: impl IntoIterator<Item = JobKind>) -> JobKinds {
        let mut kinds = JobKinds::new();
        for kind in list {
            kinds.register(kind).unwrap();
        }
        kinds
    }

    /// Installs `Source` and reports it as affected.
    fn install_kind() -> JobKind {
        JobKind::new("install", |job: Arc<Job>, _cancel| async move {
            let source = job.get_in_param("Source").unwrap();
            let source = source.as_str().unwrap().to_owned();
            job.set_out_param("AffectedPackages", vec![source]).unwrap();
            job.set_percent_complete(100).unwrap();
            job.finish_ok(0u64).unwrap();
        })
        .persistent(true)
    }

    #[test]
    fn needs_a_runtime() {
        assert!(matches!(
            Registry::start(JobKinds::new(), RegistryConfig::default()),
            Err(JobError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn numbers_are_sequential() {
        let registry = Registry::start(
            kinds([JobKind::new("noop", |_job, _cancel| async {})]),
            RegistryConfig::default(),
        )
        .unwrap();

        let a = registry.new_job("noop").unwrap();
        let b = registry.new_job("noop").unwrap();
        assert_eq!((a.number(), b.number()), (1, 2));
        assert_eq!(registry.list_job_numbers(), [1, 2]);
        assert!(matches!(
            registry.new_job("verify"),
            Err(JobError::UnknownKind(kind)) if kind == "verify"
        ));
    }

    #[tokio::test]
    async fn install_scenario_is_persisted() {
        let dir = TempDir::new().unwrap();
        let registry =
            Registry::start(kinds([install_kind()]), persisted(&dir)).unwrap();

        let job = registry.new_job("install").unwrap();
        job.set_method_name("InstallFromSoftwareIdentity").unwrap();
        job.set_in_param("Source", "pkgA-1.0-1.x86_64").unwrap();
        registry.run_job(&job).unwrap();

        assert_eq!(job.wait_finished().await, JobState::Completed);
        assert_eq!(job.result(), Some(Value::Uint64(0)));
        assert_eq!(
            job.get_out_param("AffectedPackages"),
            Some(Value::from(vec!["pkgA-1.0-1.x86_64"]))
        );

        let text = fs::read_to_string(dir.path().join("software").join("1")).unwrap();
        let on_disk = persist::decode(&text).unwrap();
        assert_eq!(on_disk.state, JobState::Completed);
        assert_eq!(registry.get_job_by_number(1).unwrap().snapshot(), on_disk);
    }

    #[tokio::test]
    async fn run_job_requires_new() {
        let gate = CancellationToken::new();
        let registry =
            Registry::start(kinds([gated("wait", gate.clone())]), RegistryConfig::default())
                .unwrap();

        let job = registry.new_job("wait").unwrap();
        registry.run_job(&job).unwrap();
        assert!(matches!(registry.run_job(&job), Err(JobError::NotNew { .. })));

        gate.cancel();
        job.wait_finished().await;
        assert!(matches!(registry.run_job(&job), Err(JobError::NotNew { .. })));
    }

    #[tokio::test]
    async fn queued_job_cannot_be_submitted_twice() {
        let gate = CancellationToken::new();
        let registry =
            Registry::start(kinds([gated("wait", gate.clone())]), serialized()).unwrap();

        let blocker = registry.new_job("wait").unwrap();
        let queued = registry.new_job("wait").unwrap();
        registry.run_job(&blocker).unwrap();
        registry.run_job(&queued).unwrap();
        let submitted = queued.time_submitted();
        assert!(submitted.is_some());

        assert!(matches!(
            registry.run_job(&queued),
            Err(JobError::AlreadySubmitted { number: 2 })
        ));
        assert_eq!(registry.list_pending_job_numbers(), [2]);
        assert_eq!(queued.time_submitted(), submitted);

        gate.cancel();
        assert_eq!(queued.wait_finished().await, JobState::Completed);
        assert!(registry.list_pending_job_numbers().is_empty());
    }

    #[tokio::test]
    async fn serialized_policy_is_fifo_not_priority() {
        let gate = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        let record = JobKind::new("record", move |job: Arc<Job>, _cancel| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(job.number());
                job.finish_ok(true).unwrap();
            }
        });
        let registry = Registry::start(
            kinds([gated("block", gate.clone()), record]),
            serialized(),
        )
        .unwrap();

        let blocker = registry.new_job("block").unwrap();
        registry.run_job(&blocker).unwrap();

        let low = registry.new_job("record").unwrap();
        low.set_priority(50);
        let high = registry.new_job("record").unwrap();
        high.set_priority(10);
        registry.run_job(&low).unwrap();
        registry.run_job(&high).unwrap();

        assert_eq!(registry.list_running_job_numbers(), [blocker.number()]);
        assert_eq!(
            registry.list_pending_job_numbers(),
            [low.number(), high.number()]
        );
        assert_eq!(low.state(), JobState::New);

        gate.cancel();
        assert_eq!(high.wait_finished().await, JobState::Completed);
        // Submission order, not priority order.
        assert_eq!(*order.lock().unwrap(), [low.number(), high.number()]);
        assert!(registry.list_pending_job_numbers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialized_policy_runs_one_at_a_time() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let step = JobKind::new("step", move |job: Arc<Job>, _cancel| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                for percent in [25, 50, 75] {
                    tokio::task::yield_now().await;
                    job.set_percent_complete(percent).unwrap();
                }
                active.fetch_sub(1, Ordering::SeqCst);
                job.finish_ok(0u64).unwrap();
            }
        });
        let registry = Registry::start(kinds([step]), serialized()).unwrap();

        let jobs: Vec<_> = (0..8).map(|_| registry.new_job("step").unwrap()).collect();
        for job in &jobs {
            registry.run_job(job).unwrap();
        }
        for job in &jobs {
            assert_eq!(job.wait_finished().await, JobState::Completed);
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // Each job started only after the one before it finished.
        for pair in jobs.windows(2) {
            let finished = pair[0].time_of_last_state_change();
            assert!(pair[1].start_time().unwrap() >= finished);
        }
    }

    #[tokio::test]
    async fn concurrent_policy_runs_everything() {
        let gate = CancellationToken::new();
        let registry = Registry::start(
            kinds([gated("wait", gate.clone())]),
            RegistryConfig::default(),
        )
        .unwrap();

        let a = registry.new_job("wait").unwrap();
        let b = registry.new_job("wait").unwrap();
        registry.run_job(&a).unwrap();
        registry.run_job(&b).unwrap();
        assert_eq!(a.state(), JobState::Running);
        assert_eq!(b.state(), JobState::Running);
        assert_eq!(registry.list_running_job_numbers(), [1, 2]);

        gate.cancel();
        a.wait_finished().await;
        b.wait_finished().await;
        registry.wait_idle().await;
        assert!(registry.list_running_job_numbers().is_empty());
    }

    #[tokio::test]
    async fn terminate_running_job_is_cooperative() {
        let registry = Registry::start(
            kinds([JobKind::new("verify", |job: Arc<Job>, cancel: CancellationToken| async move {
                cancel.cancelled().await;
                job.finish_terminate().unwrap();
            })
            .cancellable(true)]),
            RegistryConfig::default(),
        )
        .unwrap();

        let job = registry.new_job("verify").unwrap();
        registry.run_job(&job).unwrap();
        registry.terminate_job(&job).unwrap();
        assert_eq!(job.wait_finished().await, JobState::Terminated);
        assert_eq!(job.percent_complete(), 0);

        assert!(matches!(
            registry.terminate_job(&job),
            Err(JobError::AlreadyFinished { .. })
        ));
    }

    #[tokio::test]
    async fn terminate_needs_cancellable_kind() {
        let gate = CancellationToken::new();
        let registry = Registry::start(
            kinds([gated("install", gate.clone())]),
            RegistryConfig::default(),
        )
        .unwrap();

        let job = registry.new_job("install").unwrap();
        registry.run_job(&job).unwrap();
        assert!(matches!(
            registry.terminate_job(&job),
            Err(JobError::NotCancellable { .. })
        ));
        assert_eq!(job.state(), JobState::Running);

        gate.cancel();
        assert_eq!(job.wait_finished().await, JobState::Completed);
    }

    #[tokio::test]
    async fn terminate_pending_job_kills_before_start() {
        let gate = CancellationToken::new();
        let registry = Registry::start(
            kinds([gated("power", gate.clone()).cancellable(true)]),
            serialized(),
        )
        .unwrap();

        let first = registry.new_job("power").unwrap();
        let second = registry.new_job("power").unwrap();
        let idle = registry.new_job("power").unwrap();
        registry.run_job(&first).unwrap();
        registry.run_job(&second).unwrap();

        registry.terminate_job(&second).unwrap();
        assert_eq!(second.state(), JobState::Terminated);
        assert_eq!(second.start_time(), None);
        assert!(registry.list_pending_job_numbers().is_empty());

        registry.terminate_job(&idle).unwrap();
        assert_eq!(idle.state(), JobState::Terminated);

        gate.cancel();
        assert_eq!(first.wait_finished().await, JobState::Completed);
    }

    #[tokio::test]
    async fn unfinished_callbacks_are_failed() {
        let registry = Registry::start(
            kinds([
                JobKind::new("lazy", |_job, _cancel| async {}),
                JobKind::new("broken", |_job, _cancel| async { panic!("backend exploded") }),
            ]),
            serialized(),
        )
        .unwrap();

        let lazy = registry.new_job("lazy").unwrap();
        let broken = registry.new_job("broken").unwrap();
        let after = registry.new_job("lazy").unwrap();
        for job in [&broken, &lazy, &after] {
            registry.run_job(job).unwrap();
        }

        for job in [&broken, &lazy, &after] {
            assert_eq!(job.wait_finished().await, JobState::Exception);
            assert_eq!(job.status_code(), StatusCode::Failed);
            assert_eq!(job.error_type(), ErrorType::SoftwareError);
        }
    }

    #[tokio::test]
    async fn lookups() {
        let registry = Registry::start(
            kinds([JobKind::new("noop", |_job, _cancel| async {})]),
            RegistryConfig::default(),
        )
        .unwrap();

        let a = registry.new_job("noop").unwrap();
        let b = registry.new_job("noop").unwrap();
        let c = registry.new_job("noop").unwrap();
        a.set_name("update");
        b.set_name("update");
        b.set_jobid("yum-17").unwrap();

        assert_eq!(registry.get_job_by_name("update").unwrap().number(), a.number());
        assert_eq!(registry.get_job_by_id("yum-17").unwrap().number(), b.number());
        assert_eq!(registry.get_job_by_id("3").unwrap().number(), c.number());
        assert!(registry.get_job_by_id("2").is_none());
        assert!(registry.get_job_by_name("remove").is_none());
        assert!(registry.get_job_by_number(99).is_none());
    }

    #[tokio::test]
    async fn delete_only_finished_jobs() {
        let dir = TempDir::new().unwrap();
        let gate = CancellationToken::new();
        let registry = Registry::start(
            kinds([gated("install", gate.clone()).persistent(true)]),
            persisted(&dir),
        )
        .unwrap();
        let path = dir.path().join("software").join("1");

        let job = registry.new_job("install").unwrap();
        assert!(path.is_file());
        registry.run_job(&job).unwrap();
        assert!(matches!(
            registry.delete_job(&job),
            Err(JobError::NotFinished { state: JobState::Running, .. })
        ));

        gate.cancel();
        job.wait_finished().await;
        registry.delete_job(&job).unwrap();
        assert!(registry.get_job_by_number(1).is_none());
        assert!(!path.exists());
        assert!(matches!(registry.delete_job(&job), Err(JobError::UnknownJob(1))));

        // The caller's handle can still be changed, but not written back.
        assert!(job.set_priority(5));
        assert!(job.set_name("gone"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn evicted_jobs_are_not_written_back() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let registry = Registry::start_with_clock(
            kinds([JobKind::new("quick", |job: Arc<Job>, _cancel| async move {
                job.finish_ok(0u64).unwrap();
            })
            .persistent(true)]),
            persisted(&dir),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();
        let path = dir.path().join("software").join("1");

        let job = registry.new_job("quick").unwrap();
        registry.run_job(&job).unwrap();
        job.wait_finished().await;
        assert!(path.is_file());

        clock.advance(Duration::from_secs(301));
        assert_eq!(registry.evict_expired(), [1]);
        assert!(!path.exists());

        job.set_delete_on_completion(false);
        job.set_priority(5);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn persistence_failures_do_not_block_jobs() {
        let dir = TempDir::new().unwrap();
        let gate = CancellationToken::new();
        let registry = Registry::start(
            kinds([gated("install", gate.clone()).persistent(true)]),
            persisted(&dir),
        )
        .unwrap();

        let job = registry.new_job("install").unwrap();
        registry.run_job(&job).unwrap();
        // Every write from here on fails.
        fs::remove_dir_all(dir.path().join("software")).unwrap();

        assert!(job.set_name("offline"));
        gate.cancel();
        // The gated processor unwraps finish_ok, so a failed finish would
        // surface as EXCEPTION instead.
        assert_eq!(job.wait_finished().await, JobState::Completed);
        assert_eq!(job.result(), Some(Value::Uint64(0)));
        assert_eq!(job.name().as_deref(), Some("offline"));
        assert!(!dir.path().join("software").exists());
    }

    #[tokio::test]
    async fn eviction_honours_policy() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let registry = Registry::start_with_clock(
            kinds([JobKind::new("quick", |job: Arc<Job>, _cancel| async move {
                job.finish_ok(0u64).unwrap();
            })]),
            RegistryConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();

        let evict = registry.new_job("quick").unwrap();
        let keep = registry.new_job("quick").unwrap();
        keep.set_delete_on_completion(false);
        let idle = registry.new_job("quick").unwrap();
        registry.run_job(&evict).unwrap();
        registry.run_job(&keep).unwrap();
        evict.wait_finished().await;
        keep.wait_finished().await;

        clock.advance(Duration::from_secs(300));
        assert!(registry.evict_expired().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(registry.evict_expired(), [evict.number()]);
        assert_eq!(registry.list_job_numbers(), [keep.number(), idle.number()]);
    }

    #[tokio::test]
    async fn recovery_resumes_and_requeues() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("software")).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut running = JobRecord::new(4, "install", t);
        running.state = JobState::Running;
        running.jobid = Some("yum-4".into());
        running.time_submitted = Some(t);
        running.start_time = Some(t);
        let mut queued = JobRecord::new(5, "install", t);
        queued.time_submitted = Some(t);
        let idle = JobRecord::new(6, "install", t);
        let mut done = JobRecord::new(9, "install", t);
        done.state = JobState::Completed;
        done.result = Some(Value::Uint64(0));
        let stranger = JobRecord::new(10, "firmware", t);
        for record in [&running, &queued, &idle, &done, &stranger] {
            store.save(record).unwrap();
        }

        let reattached = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&reattached);
        let install = JobKind::new("install", move |job: Arc<Job>, _cancel| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push((job.number(), job.has_backend_jobid()));
                job.finish_ok(0u64).unwrap();
            }
        })
        .persistent(true);
        let registry = Registry::start(kinds([install]), persisted(&dir)).unwrap();

        assert_eq!(registry.list_job_numbers(), [4, 5, 6, 9]);
        let resumed = registry.get_job_by_id("yum-4").unwrap();
        assert_eq!(resumed.wait_finished().await, JobState::Completed);
        // Resumed jobs keep their original start time.
        assert_eq!(resumed.start_time(), Some(t));
        let requeued = registry.get_job_by_number(5).unwrap();
        assert_eq!(requeued.wait_finished().await, JobState::Completed);
        assert_eq!(registry.get_job_by_number(6).unwrap().state(), JobState::New);

        let mut seen = reattached.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, [(4, true), (5, false)]);

        // Numbers continue past everything on disk, recovered or not.
        assert_eq!(registry.new_job("install").unwrap().number(), 11);
    }

    #[tokio::test]
    async fn recovery_skips_out_of_range_numbers() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("software")).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store.save(&JobRecord::new(u64::MAX, "install", t)).unwrap();
        store.save(&JobRecord::new(3, "install", t)).unwrap();

        let registry = Registry::start(kinds([install_kind()]), persisted(&dir)).unwrap();
        assert_eq!(registry.list_job_numbers(), [3]);
        assert_eq!(registry.new_job("install").unwrap().number(), 4);
    }

    #[tokio::test]
    async fn shutdown_stops_the_sweeper() {
        let registry = Registry::start(
            kinds([JobKind::new("noop", |_job, _cancel| async {})]),
            RegistryConfig {
                sweep_interval: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap();
        registry.shutdown().await;
        assert!(registry.shared.sweeper.lock().unwrap().is_none());
        assert!(registry.shared.shutdown.is_cancelled());
    }
}
