//! An in-process manager for long-running asynchronous jobs.
//!
//! A [`Registry`] creates [`Job`]s of registered [`JobKind`]s, runs them on
//! tokio workers under a concurrent or serialized [`ExecutionPolicy`], lets
//! cancellable kinds be terminated cooperatively, and (for persistent kinds)
//! mirrors every job change into a YAML document so jobs survive a restart.
pub mod clock;
pub mod config;
pub mod error;
pub mod kind;
pub mod persist;
pub mod registry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExecutionPolicy, RegistryConfig};
pub use error::{JobError, PersistError, ValueError};
pub use kind::{JobKind, JobKinds, JobProcessor, JobView, ParamDirection};
pub use registry::Registry;
pub use types::event::{JobEvent, JobListener, Property};
pub use types::job::{Job, JobRecord};
pub use types::params::ParamBag;
pub use types::states::{ErrorType, JobState, StatusCode};
pub use types::value::Value;
