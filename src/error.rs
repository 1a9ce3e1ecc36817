//! Custom error types for the PMAC client.
//!
//! This module defines the primary error type, `PmacError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single place to describe everything
//! that can go wrong between a caller and a motion controller.
//!
//! ## Error Hierarchy
//!
//! `PmacError` groups its variants into the categories the rest of the crate
//! relies on:
//!
//! - **Connection**: a link could not be opened (unknown host, refused connection,
//!   bad credentials, serial port already in use). The message is the descriptive
//!   text returned from `connect`.
//! - **Transport faults**: broken links, malformed or truncated responses, response
//!   timeouts and the Ethernet NULL-terminator condition. The `CommandChannel`
//!   translates all of these into a `(message, false)` result and never lets them
//!   escape as an `Err`. See [`PmacError::is_transport_fault`].
//! - **Programmer errors**: out-of-range axes, asking for MACRO data on an on-board
//!   axis, unsupported models. These are returned as `Err` and never swallowed.
//! - **Configuration**: file/environment parsing through `figment`, and semantic
//!   validation failures.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PmacResult<T> = std::result::Result<T, PmacError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum PmacError {
    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to PMAC")]
    NotConnected,

    #[error("PMAC communication error: unexpected terminator")]
    UnexpectedTerminator,

    #[error("PMAC communication error: timeout")]
    DeviceTimeout,

    #[error("PMAC communication error: short response")]
    TruncatedResponse,

    #[error("PMAC sent NULL terminator")]
    NullTerminator,

    #[error("Timed out waiting for expected response. Got only: {0:?}")]
    ResponseTimeout(String),

    #[error("Communication with PMAC broken: {0}")]
    LinkBroken(String),

    #[error("Received malformed input from PMAC ({0:?})")]
    MalformedResponse(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("Unsupported PMAC model (code {0})")]
    UnsupportedModel(u32),

    #[error("Asking for a negative axis")]
    NegativeAxis,

    #[error("Requested axis {axis} but PMAC has only {available} axes")]
    AxisOutOfRange { axis: i32, available: u32 },

    #[error("Axis {0} is not on the MACRO ring")]
    NotMacroStationAxis(i32),

    #[error("Axis {0} is not an onboard axis")]
    NotOnboardAxis(i32),

    #[error("Could not recognise direction: {0}")]
    InvalidDirection(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[cfg(feature = "ssh")]
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Blocking I/O task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PmacError {
    /// Returns `true` for faults raised while talking over the wire.
    ///
    /// These are the errors the `CommandChannel` reports as `success = false`
    /// instead of propagating them.
    pub fn is_transport_fault(&self) -> bool {
        match self {
            PmacError::Io(_)
            | PmacError::NotConnected
            | PmacError::UnexpectedTerminator
            | PmacError::DeviceTimeout
            | PmacError::TruncatedResponse
            | PmacError::NullTerminator
            | PmacError::ResponseTimeout(_)
            | PmacError::LinkBroken(_)
            | PmacError::Task(_) => true,
            #[cfg(feature = "ssh")]
            PmacError::Ssh(_) => true,
            _ => false,
        }
    }
}

impl From<figment::Error> for PmacError {
    fn from(err: figment::Error) -> Self {
        PmacError::Config(Box::new(err))
    }
}
