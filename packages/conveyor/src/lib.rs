// Conveyor - distributed persistent job queue
//
// Producers submit jobs; workers execute them with at-least-once
// semantics, bounded retries, lease-based failure detection, and explicit
// cancellation. All coordination happens through a key/value store with
// atomic multi-key transactions; the transition engine is the sole writer
// of job state.

pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod worker;

pub use config::Config;
pub use engine::{Engine, EngineConfig, SkipReason, TransitionOutcome};
pub use error::{DecodeError, QueueError, StoreError};
pub use record::{JobRecord, JobState, ScheduleOptions};
pub use registry::{SharedTaskRegistry, TaskRegistry};
pub use scheduler::{Scheduler, SchedulerConfig, TickSummary};
pub use store::{MemoryStore, RedisStore, Store};
pub use worker::{Worker, WorkerConfig};
