//! Core types and utilities

pub mod config;
pub mod error;
pub mod logging;
pub mod stats;
pub mod types;

pub use error::Error;
pub use types::*;
