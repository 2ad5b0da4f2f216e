use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use jobkeeper::{ExecutionPolicy, RegistryConfig};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Reads registry settings from a YAML file. Flags override it.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Enables persistence and sets the directory to store job documents in.
    #[arg(short = 'b', long)]
    pub(crate) persist_dir: Option<PathBuf>,
    /// Sets the persistence profile (a subdirectory of the persist dir).
    #[arg(short, long)]
    pub(crate) profile: Option<String>,
    /// Runs one job at a time, in submission order.
    #[arg(short, long, default_value_t)]
    pub(crate) serialized: bool,
    /// Submits a job that sleeps for this many seconds. May be repeated.
    #[arg(long = "sleep", value_name = "SECONDS")]
    pub(crate) sleeps: Vec<u64>,
    /// Exits once every job has finished instead of waiting for Ctrl-C.
    #[arg(short = 'x', long, default_value_t)]
    pub(crate) exit_when_idle: bool,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn registry_config(&self) -> Result<RegistryConfig> {
        let mut config = match &self.config {
            Some(path) => RegistryConfig::from_yaml_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => RegistryConfig::default(),
        };

        if let Some(dir) = &self.persist_dir {
            config.persistence_root = Some(dir.clone());
        }
        if let Some(profile) = &self.profile {
            config.profile = profile.clone();
        }
        if self.serialized {
            config.policy = ExecutionPolicy::Serialized;
        }

        Ok(config)
    }
}
