//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function returning the
//! process exit code.

pub mod history;
pub mod migrate;
pub mod run;
pub mod trend;
