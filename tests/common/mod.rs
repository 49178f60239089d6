//! Common test utilities
//!
//! Builders that wire the link components around a [`SimulatedTransport`]
//! without starting the periodic sampler, so tests decide when the monitor
//! learns about link changes.

pub mod fixtures;
