//! Error type shared by every layer of the engine.
//!
//! All of these are fatal for the operator call that raised them: nothing in the
//! engine retries. The embedding application decides whether a failed call also
//! ends the process.

use briny::prelude::ValidationError;

/// Every failure the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operator precondition did not hold (checked before any allocation or build).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A kernel program failed to preprocess or compile.
    #[error("failed to build program '{program}': {msg}")]
    Compile { program: String, msg: String },

    /// The device-side out-of-range check recorded a fault.
    #[error("kernel '{kernel}' reported error code {code}")]
    KernelFault { kernel: String, code: u32 },

    /// A kernel launch was rejected by the device.
    #[error("failed to launch kernel '{kernel}': {msg}")]
    Launch { kernel: String, msg: String },

    /// Device initialization or memory failure.
    #[error("device error: {0}")]
    Device(String),

    /// The key-value store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Decoded data failed its integrity check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The CPU worker pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl Error {
    /// Shorthand for [`Error::Precondition`].
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Shorthand for [`Error::Device`].
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }
}

impl From<ValidationError> for Error {
    fn from(_: ValidationError) -> Self {
        Self::Validation("data rejected by integrity check".to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::Precondition`] unless `cond` holds.
macro_rules! ensure {
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Precondition(format!($($fmt)+)));
        }
    };
}

pub(crate) use ensure;
