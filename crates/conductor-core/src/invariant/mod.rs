//! Best-effort project command execution (smoke tests, build/test checks),
//! shared by the Task Processor's `smoke_test` action.

pub mod runner;

pub use runner::{CommandResult, run_command};
