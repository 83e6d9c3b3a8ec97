//! Error types for KiranaCorrect
//!
//! Calibration math is infallible once the tables exist; the errors here are
//! argument/shape problems, allocation failures surfaced as values rather
//! than aborts, and I/O failures from the calibration store.

use thiserror::Error;

/// Errors that can occur in KiranaCorrect
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("dimension mismatch: expected {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("allocation of {0} bytes failed")]
    Allocation(usize),

    #[error("calibration file is malformed: {0}")]
    Format(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
