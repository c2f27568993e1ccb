//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the cache crates:
//! - Logging and tracing initialisation
//! - Log-safe formatting helpers for URLs and paths
//!
//! Hosts call [`logging::init_logging`] once at startup, before constructing
//! the cache service.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
