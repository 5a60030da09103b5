//! Core types for the pgbridge sandboxed SQL parser.

pub mod config;
pub mod error;

pub use config::*;
pub use error::{Error, Fault, Result, SqlError};
