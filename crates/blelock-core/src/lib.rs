//! Core types shared across the blelock SDK.
//!
//! This crate holds the vocabulary of the lock-control stack: the semantic
//! error enum, the observable state enums, credential newtypes with their
//! validation rules, and the wire-level constants (timeouts, pacing, frame
//! bounds) that the protocol and session crates agree on.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
