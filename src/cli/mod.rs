//! CLI module for chanipc - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for serving channels and
//! calling a running server.

pub mod commands;

pub use commands::Cli;
