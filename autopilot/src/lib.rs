//! Control plane for an autonomous coding-agent orchestrator.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic policy (trust tiers, budget checks,
//!   loop detection, feature graph, harness transitions, recommendations).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (persistent store, project state
//!   documents, processes, agent CLI, prompt rendering, config).
//!
//! Orchestration modules ([`trust`], [`budget`], [`loops`], [`features`],
//! [`tracer`], [`learning`], [`router`], [`harness`], [`idle`],
//! [`orchestrator`]) compose the two into the components the CLI and
//! embedding applications use.

pub mod budget;
pub mod core;
pub mod exit_codes;
pub mod features;
pub mod harness;
pub mod idle;
pub mod io;
pub mod learning;
pub mod logging;
pub mod loops;
pub mod orchestrator;
pub mod router;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tracer;
pub mod trust;
