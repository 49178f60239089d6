//! Test organization for the pairlink subsystem
//!
//! - `common`: Shared fixtures wiring components over the simulated transport
//! - `unit`: Focused tests for individual rules and tables
//! - `integration`: Components working together under paused tokio time

pub mod common;
