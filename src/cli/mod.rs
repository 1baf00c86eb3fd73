//! CLI module for fragdb
//!
//! One-shot commands against the configured cluster, plus `watch`, which
//! keeps the recovery loop running until interrupted. Output is JSON.

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, ExperimentCommand, LogView, SweepKind};
pub use commands::{dispatch, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_request, write_error, write_response};
