#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod clock;
mod config;
mod dispatch;
mod engine;
mod errors;
mod escalation;
mod incident;
mod intake;
mod job_registry;
/// Built-in job types.
pub mod jobs;
/// Pure on-call resolution.
pub mod oncall;
mod queue;
mod reaper;
mod runner;
/// Database schema definitions.
pub mod schema;
/// SLA targets and breach warnings.
pub mod sla;
mod storage;
mod util;
mod worker;

/// The trait implemented by every job type.
pub use self::background_job::{BackgroundJob, JobOutcome};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::EngineConfig;
/// The notification delivery contract.
pub use self::dispatch::{Dispatcher, LogDispatcher, NotificationRequest, TemplateData};
/// The engine every operation hangs off.
pub use self::engine::Engine;
pub use self::errors::{DispatchError, EngineError, EventError, StoreError};
pub use self::escalation::EscalationOutcome;
pub use self::intake::{EventAction, EventDetails, EventOutcome, EventPayload, EventResult, Severity};
pub use self::queue::backoff_delay;
/// The runner that polls the job queue.
pub use self::runner::{RunHandle, Runner};
pub use self::storage::{
    EscalationAdvance, MemoryStore, NewAlert, NewIncident, NewJob, NewNotification, PgStore,
    StepExecution, Store, Transition, setup_database,
};
