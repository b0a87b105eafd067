//! # Command-Line Module
//!
//! Argument handling for the probe binaries. Instead of a fixed derive
//! struct, commands are collected in a [`registry::CommandRegistry`]: each
//! binary registers the flags it cares about (or pulls in one of the
//! common groups), parses once, and reads values back by name. The
//! registry is a thin layer over the `clap` builder API; `clap` owns help
//! rendering, usage errors and type checking.
//!
//! Parsing happens at most once per registry. A required command that is
//! missing is fatal: help is printed and the process exits with a
//! non-zero status.

pub mod registry;

pub use registry::{
    CommandRegistry, CommandSpec, CommandValue, ParsedCommands, RegistryError,
};

use tracing_subscriber::filter::LevelFilter;

/// Maps a `--verbosity` choice onto a tracing level filter.
///
/// Unknown values fall back to `off`, mirroring the registered default.
pub fn verbosity_filter(verbosity: &str) -> LevelFilter {
    match verbosity {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::OFF,
    }
}

/// The `--verbosity` choices offered by the logging command group.
pub const VERBOSITY_CHOICES: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_known_levels() {
        assert_eq!(verbosity_filter("info"), LevelFilter::INFO);
        assert_eq!(verbosity_filter("trace"), LevelFilter::TRACE);
        assert_eq!(verbosity_filter("off"), LevelFilter::OFF);
    }

    #[test]
    fn verbosity_falls_back_to_off() {
        assert_eq!(verbosity_filter("chatty"), LevelFilter::OFF);
    }
}
