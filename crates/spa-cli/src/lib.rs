//! SPA CLI - command line front end over a local sandbox
//!
//! The `spa` binary drives the planning and execution halves against a
//! [`sandbox`] backend: usage comes from a JSON fixture, purchases land in a
//! JSON ledger file and intents wait in a directory-backed queue.

#![warn(missing_docs)]

pub mod commands;
pub mod sandbox;

pub use commands::SandboxPaths;
pub use sandbox::{FileLedger, Fixture, FixtureCategory, LedgerRecord, SandboxError, SandboxUsage};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
