//! Timed re-injection of parked WAIT tasks.
//!
//! The [`WaitTaskPoller`] sweeps the store on a fixed delay, publishes a
//! `FINISH_TASK` event for every parked task whose deadline has passed and
//! clears the deadline so the task is released once.

pub mod error;
pub mod poller;

pub use error::PollerError;
pub use poller::{PollerConfig, SweepReport, WaitTaskPoller};
