use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PersistError;

/// How the registry runs submitted jobs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// Every job gets its own worker as soon as it is submitted.
    #[default]
    Concurrent,
    /// At most one job runs at a time; the rest wait in submission order.
    Serialized,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryConfig {
    /// Root under which per-profile job directories live. Persistence is off
    /// when unset.
    pub persistence_root: Option<PathBuf>,
    pub profile: String,
    pub policy: ExecutionPolicy,
    /// How often finished jobs are checked for eviction.
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            persistence_root: None,
            profile: "default".to_owned(),
            policy: ExecutionPolicy::Concurrent,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, PersistError> {
        let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Directory holding this profile's job documents, if persistence is on.
    pub fn persistence_dir(&self) -> Option<PathBuf> {
        self.persistence_root
            .as_ref()
            .map(|root| root.join(&self.profile))
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
