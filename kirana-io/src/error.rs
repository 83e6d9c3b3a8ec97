//! Error types for KiranaIO
//!
//! # Error Layers
//!
//! Failures fall into three layers with different recovery characters:
//!
//! ## Transport (retry is the caller's decision)
//!
//! - **`Timeout`**: no response within the configured deadline. The
//!   heartbeat treats this as a miss and retries on its own schedule;
//!   command callers decide per call.
//! - **`Io`**: socket-level failure. Usually retryable after the network
//!   recovers.
//! - **`Closed`**: the transport handle disappeared while in use. Fatal for
//!   the owning session.
//!
//! ## Protocol (surface to the sink, return typed failure)
//!
//! - **`ShortRead`**, **`CrcMismatch`**, **`OpcodeMismatch`**,
//!   **`DeviceError`**: the device answered, but the answer is unusable or
//!   carries a device-side error code. One `on_error` delivery per failure;
//!   the session stays open.
//!
//! ## Semantic (pure caller-side, never retried)
//!
//! - **`NotOpen`**, **`AlreadyOpen`**, **`InvalidArgument`**,
//!   **`Unsupported`**, **`NotInitialized`**: wrong lifecycle state or
//!   arguments. Fix the call, not the network.

use thiserror::Error;

/// Errors that can occur in KiranaIO
///
/// See module-level documentation for the recovery contract per layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("transport closed")]
    Closed,

    #[error("short response: {0} bytes")]
    ShortRead(usize),

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("opcode mismatch: sent {sent:#04x}, device echoed {echoed:#04x}")]
    OpcodeMismatch { sent: u8, echoed: u8 },

    #[error("device returned error code {0}")]
    DeviceError(u8),

    #[error("session not open")]
    NotOpen,

    #[error("session already open")]
    AlreadyOpen,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("command does not support this operation")]
    Unsupported,

    #[error("factory not initialized")]
    NotInitialized,

    #[error("buffer allocation of {0} bytes failed")]
    Allocation(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("correction pipeline error: {0}")]
    Pipeline(#[from] kirana_correct::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
