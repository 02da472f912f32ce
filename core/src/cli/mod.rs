//! Command-line parsing for the `aoremoteclient` binary.

pub mod parse;

pub use parse::{parse_args, Command, Invocation};
