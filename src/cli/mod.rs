//! Command-line interface for fmri-postproc.
//!
//! Provides the `subjects`, `subject` and `image` entry levels.

mod commands;

pub use commands::{normalize_args, parse_cli, run, run_with_cli, Cli, Commands};
