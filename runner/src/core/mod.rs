//! Deterministic, pure logic for contract evaluation.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod invariants;
pub mod metrics;
pub mod structured;
pub mod types;
