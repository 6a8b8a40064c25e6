//! Subcommand implementations.

pub mod capture;
pub mod replay;
