//! switchyard orchestrator service.
//!
//! Wires the decider to NATS consumers, runs the wait-task poller against
//! Postgres, and serves the management API.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
