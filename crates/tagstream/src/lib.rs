//! # tagstream shared library
//!
//! Infrastructure shared by the tagstream crates:
//! - **error**: common error type for the command-line shell
//! - **tracing**: logging setup and tagstream segment prefixes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tagstream::error::Error;
//! tagstream::tracing::init();
//! ```

pub mod error;
pub mod tracing;

pub use error::{Error, Result};
