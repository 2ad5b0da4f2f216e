mod args;
mod demo;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use jobkeeper::{JobListener, Registry};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation on Ctrl-C.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = args.registry_config()?;
    let registry = Registry::start(demo::kinds()?, config)
        .context("starting job registry")?;

    // Recovered jobs were dispatched inside `start`, so whatever they did
    // before the logger is attached is only visible as their current state.
    let logger: Arc<dyn JobListener> = Arc::new(demo::log_events);
    for number in registry.list_job_numbers() {
        if let Some(job) = registry.get_job_by_number(number) {
            job.subscribe(Arc::clone(&logger));
            info!(job = number, jobid = %job.jobid(), state = %job.state(), "recovered job");
        }
    }

    for &seconds in &args.sleeps {
        let job = registry.new_job(demo::SLEEP)?;
        job.subscribe(Arc::clone(&logger));
        job.set_name(format!("sleep {seconds}s"));
        job.set_method_name("Sleep")?;
        job.set_in_param("Seconds", seconds)?;
        registry
            .run_job(&job)
            .with_context(|| format!("submitting job {}", job.number()))?;
    }

    info!(
        jobs = registry.list_job_numbers().iter().join(","),
        pending = registry.list_pending_job_numbers().iter().join(","),
        "jobs submitted"
    );

    if args.exit_when_idle {
        select! {
            _ = registry.wait_idle() => {},
            _ = cancel.cancelled() => {},
        }
    } else {
        cancel.cancelled().await;
    }

    // Ask whatever is still queued or running to stop, then let it finish.
    let unfinished = registry
        .list_pending_job_numbers()
        .into_iter()
        .chain(registry.list_running_job_numbers());
    for number in unfinished {
        let Some(job) = registry.get_job_by_number(number) else {
            continue;
        };
        if let Err(error) = registry.terminate_job(&job) {
            warn!(job = number, %error, "could not terminate job");
        }
    }
    registry.wait_idle().await;
    registry.shutdown().await;

    Ok(())
}
