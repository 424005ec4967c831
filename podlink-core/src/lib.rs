#![forbid(unsafe_code)]

//! Shared configuration, error taxonomy, and constants for the
//! podlink tunnel core.
//!
//! This crate intentionally stays small: it is the common sink type
//! other crates convert their own errors into at crate boundaries, and
//! the place the embedding daemon's static settings live.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CoreError, Result};
/// Re-exported so downstream crates pin their `tracing` version to this
/// crate's rather than declaring their own dependency on it.
pub use tracing;
