//! Step control for decentralized averaging.
//!
//! This crate coordinates a single averaging step between a controlling
//! process and a worker process: the controller schedules the step and
//! decides when the worker may enter the collective-exchange phase, while
//! the worker runs matchmaking and the exchange itself and reports progress.
//!
//! The central type is [`StepControl`]: an asynchronously resolved handle
//! backed by a small lock-free shared-memory block of scheduling and
//! progress fields, with a one-shot trigger gate the controller resolves to
//! unblock the allreduce phase.

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod promise;
pub mod shm;
pub mod stage;
pub mod step;

pub use config::StepConfig;
pub use control::{GroupInfo, StepControl, StepDescriptor};
pub use error::{ControlError, Result};
pub use promise::{Outcome, Promise};
pub use shm::SharedScheduleBlock;
pub use stage::AveragingStage;
pub use step::{run_step, AllReduce, Matchmaking};
