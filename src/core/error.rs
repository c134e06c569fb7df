//! Error types for splatsurf

use thiserror::Error;

/// Main error type for the reconstruction pipeline.
///
/// All failures are fatal for the current run; nothing in the core retries.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller violated an API contract (zero-element allocation, oversized
    /// element, out-of-range build parameters).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The compute device lacks a required capability.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The estimated device memory footprint exceeds what the device can hold.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed input stream. The message carries the source identifier.
    #[error("format error: {0}")]
    Format(String),

    /// Failure surfaced by the compute backend.
    #[error("device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Prepend a source identifier (typically a file name) to a format error.
    pub fn with_source(self, source: &str) -> Self {
        match self {
            Error::Format(msg) => Error::Format(format!("{}: {}", source, msg)),
            other => other,
        }
    }
}
