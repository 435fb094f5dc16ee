//! Deterministic, pure logic shared by the control plane.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod features;
pub mod harness_state;
pub mod hashing;
pub mod loops;
pub mod plan;
pub mod recommend;
pub mod schedule;
pub mod sequence;
pub mod triage;
pub mod trust;
pub mod types;
