//! CLI module for georepl - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
