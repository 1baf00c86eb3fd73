//! fragdb CLI entry point
//!
//! Parses arguments and runs one command via `cli::run`. On failure the
//! error is printed as a JSON error line and the process exits non-zero.

use fragdb::cli;

fn main() {
    if let Err(e) = cli::run() {
        let _ = cli::write_error(e.code_str(), e.message());
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
