use std::sync::Arc;
use std::time::Duration;

use jobkeeper::{
    Job, JobError, JobEvent, JobKind, JobKinds, JobRecord, Property, StatusCode,
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const SLEEP: &str = "sleep";

pub(crate) fn kinds() -> Result<JobKinds, JobError> {
    let mut kinds = JobKinds::new();
    kinds.register(
        JobKind::new(SLEEP, sleep)
            .cancellable(true)
            .persistent(true),
    )?;
    Ok(kinds)
}

/// Sleeps for the `Seconds` input one second at a time, recording progress
/// in `ElapsedSeconds` so a recovered job picks up where it left off.
async fn sleep(job: Arc<Job>, cancel: CancellationToken) {
    let Some(seconds) = job.get_in_param("Seconds").and_then(|v| v.as_u64())
    else {
        let _ = job.finish_exception(
            StatusCode::InvalidParameter,
            "missing or invalid Seconds parameter",
        );
        return;
    };

    if !job.has_backend_jobid() {
        let _ = job.set_jobid(format!("sleep-{}", job.number()));
    }
    let already = job
        .get_out_param("ElapsedSeconds")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    for elapsed in already + 1..=seconds {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {},
            _ = cancel.cancelled() => {
                let _ = job.finish_terminate();
                return;
            },
        }

        let percent = u8::try_from(elapsed * 100 / seconds).unwrap_or(100);
        if let Err(error) =
            job.report_progress(percent, [("ElapsedSeconds", elapsed)])
        {
            warn!(%error, "stopping sleep job");
            return;
        }
    }

    let _ = job.finish_ok(seconds);
}

/// Logs the lifecycle of a job.
pub(crate) fn log_events(job: &JobRecord, events: &[JobEvent]) {
    for event in events {
        match event {
            JobEvent::StateChanged { old, new } => {
                info!(job = job.number, jobid = %job.effective_jobid(), %old, %new, "job state changed");
            },
            JobEvent::Finished { new, result, error, .. } => {
                info!(
                    job = job.number,
                    state = %new,
                    result = result.as_ref().map(ToString::to_string),
                    error = error.as_deref(),
                    "job finished"
                );
            },
            JobEvent::Modified(Property::PercentComplete) => {
                debug!(job = job.number, percent = job.percent_complete, "job progress");
            },
            _ => {},
        }
    }
}
