//! Persistence of job state: one YAML document per job, named by its jobid,
//! under a per-profile directory.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use itertools::Itertools;
use tracing::{error, trace, warn};

use crate::clock::Clock;
use crate::error::PersistError;
use crate::kind::JobKinds;
use crate::types::event::{JobEvent, JobListener};
use crate::types::job::{Job, JobRecord};

/// Encodes a job's full state as a YAML document.
pub fn encode(record: &JobRecord) -> Result<String, PersistError> {
    Ok(serde_yaml::to_string(record)?)
}

/// Decodes a document produced by [`encode`].
pub fn decode(text: &str) -> Result<JobRecord, PersistError> {
    Ok(serde_yaml::from_str(text)?)
}

/// Decodes a document into a job of its registered kind.
pub fn decode_job(
    text: &str,
    kinds: &JobKinds,
    clock: Arc<dyn Clock>,
) -> Result<Job, PersistError> {
    let record = decode(text)?;
    let kind = kinds.get(&record.kind).ok_or_else(|| PersistError::UnknownKind {
        number: record.number,
        kind: record.kind.clone(),
    })?;
    Ok(Job::from_record(record, Arc::clone(kind), clock))
}

/// Jobids become file names, so they must be a single plain path component.
fn check_jobid(jobid: &str) -> Result<(), PersistError> {
    if jobid.is_empty()
        || jobid.starts_with('.')
        || jobid.contains(['/', '\\', '\0'])
    {
        return Err(PersistError::InvalidJobId(jobid.to_owned()));
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_owned(),
        source,
    }
}

fn remove_file_if_present(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path)(e)),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct Files {
    /// Where each job was last written, so a jobid change can drop the stale
    /// file.
    written: HashMap<u64, PathBuf>,
    /// Jobs removed from the store. Handles to them may outlive the removal,
    /// so their later saves are dropped.
    retired: HashSet<u64>,
}

/// The directory of persisted jobs for one profile.
#[derive(Debug)]
pub struct JobStore {
    dir: PathBuf,
    files: Mutex<Files>,
}

impl JobStore {
    /// Opens the directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self {
            dir,
            files: Mutex::new(Files::default()),
        })
    }

    fn files(&self) -> MutexGuard<'_, Files> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, jobid: &str) -> Result<PathBuf, PersistError> {
        check_jobid(jobid)?;
        Ok(self.dir.join(jobid))
    }

    /// Writes the job's document, replacing any earlier one atomically.
    ///
    /// Does nothing for a job that has been removed.
    pub fn save(&self, record: &JobRecord) -> Result<(), PersistError> {
        let jobid = record.effective_jobid();
        let path = self.path_for(&jobid)?;
        let tmp = self.dir.join(format!(".{jobid}.tmp"));
        let text = encode(record)?;

        // Held across the write so a concurrent remove cannot be undone.
        let mut files = self.files();
        if files.retired.contains(&record.number) {
            trace!(job = record.number, "not persisting removed job");
            return Ok(());
        }

        fs::write(&tmp, text).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        trace!(job = record.number, path = %path.display(), state = %record.state, "persisted job");

        match files.written.insert(record.number, path.clone()) {
            Some(old) if old != path => remove_file_if_present(&old),
            _ => Ok(()),
        }
    }

    /// Deletes the job's document, if one was written, and ignores any
    /// later save of it.
    pub fn remove(&self, number: u64) -> Result<(), PersistError> {
        let mut files = self.files();
        files.retired.insert(number);
        match files.written.remove(&number) {
            Some(path) => remove_file_if_present(&path),
            None => Ok(()),
        }
    }

    /// Reads every job document in the directory, ordered by job number.
    ///
    /// Unreadable or malformed documents are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<JobRecord>, PersistError> {
        let entries = fs::read_dir(&self.dir).map_err(io_error(&self.dir))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(dir = %self.dir.display(), %error, "failed to list job directory entry");
                    continue;
                },
            };
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.is_file() {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(io_error(&path))
                .and_then(|text| decode(&text))
            {
                Ok(record) => records.push((path, record)),
                Err(error) => {
                    error!(path = %path.display(), %error, "skipping unreadable job document");
                },
            }
        }

        let mut files = self.files();
        Ok(records
            .into_iter()
            .sorted_by_key(|(_, record)| record.number)
            .map(|(path, record)| {
                files.written.insert(record.number, path);
                record
            })
            .collect())
    }
}

/// Rewrites a job's document after every change to it.
pub(crate) struct Persister {
    store: Arc<JobStore>,
}

impl Persister {
    pub(crate) fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }
}

impl JobListener for Persister {
    fn on_events(&self, job: &JobRecord, _events: &[JobEvent]) {
        // Best effort: the in-memory state stands even if the write fails.
        if let Err(error) = self.store.save(job) {
            error!(job = job.number, %error, "failed to persist job");
        }
    }
}
