//! Execution engine for tree-expanded test branches.
//!
//! A test tree (built and expanded elsewhere) hands over [`branch::Branch`]
//! values one at a time; a [`run_instance::RunInstance`] executes their
//! steps sequentially, scoping variables, running hooks, and capturing
//! errors. The architecture enforces a strict separation:
//!
//! - **Data model** ([`step`], [`branch`], [`value`], [`error`]): run-time
//!   records and the dynamic value type, no execution logic.
//! - **Seams** ([`tree`], [`runner`]): traits and narrow structs through
//!   which the external parser/orchestrator plug in, mockable in tests.
//! - **Execution** ([`run_instance`], [`compare`]): the per-step protocol,
//!   variable resolution, and the structural matcher test code asserts
//!   with.

pub mod branch;
pub mod compare;
pub mod config;
pub mod error;
pub mod logging;
pub mod run_instance;
pub mod runner;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
pub mod value;
