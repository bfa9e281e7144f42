//! Core types and utilities for the switchyard workflow orchestrator.
//!
//! This crate provides the foundational pieces shared by every other
//! switchyard crate: the `Result` alias over rootcause reports, strongly
//! typed 64-bit identifiers, and the Snowflake-style [`IdGenerator`] that
//! mints them without cross-node coordination.

pub mod error;
pub mod hash;
pub mod id;
pub mod snowflake;

pub use error::Result;
pub use hash::stable_hash;
pub use id::{
    MessageId, ParseIdError, TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId,
    WorkflowInstanceId,
};
pub use snowflake::{IdError, IdGenerator, ParsedId};
