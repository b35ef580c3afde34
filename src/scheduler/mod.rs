//! Download task scheduler.
//!
//! Admits pending tasks into a bounded worker pool under global and
//! per-platform limits, drives each through extraction, transfer and
//! conversion, and recovers unfinished work from the store on startup.

mod admission;
mod error;
mod retry_policy;
mod service;
mod throttle;
mod worker;

pub use admission::{select, AdmissionSlots};
pub use error::{SchedulerError, SchedulerResult};
pub use retry_policy::RetryPolicy;
pub use service::Scheduler;
pub use throttle::{AdmissionThrottler, SlidingWindowThrottler};
