//! Command-line interface for the job queue engine.
//!
//! Exposes enqueue, worker, reap, and admin subcommands over the same
//! `clap::Parser`/`run_with_cli` split the rest of this codebase's CLI
//! uses, so `main.rs` only has to parse once and pick a log level before
//! handing off.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
