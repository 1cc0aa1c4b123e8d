//! Error handling for the hot-wire cutter driver
//!
//! Layers:
//! - `TransportError` - serial port open/read/write failures
//! - `ProtocolError` - malformed commands or wire frames rejected before reaching hardware
//! - `MachineError` - firmware-reported faults (error replies, unexpected machine states)
//! - `StreamError` - G-code program stream failures
//!
//! All layers are unified behind one [`Error`] / [`Result`] pair.

use thiserror::Error;

/// Failures opening or operating the serial transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// No serial port matched the expected vendor/product identifiers.
    #[error("port not found: {port}")]
    PortNotFound { port: String },

    /// The OS refused to open the port.
    #[error("failed to open port {port}: {reason}")]
    FailedToOpen { port: String, reason: String },

    /// A write or read failed after the port was already open.
    #[error("I/O error on {port}: {reason}")]
    Io { port: String, reason: String },

    /// The link was closed, so the operation could not proceed.
    #[error("link is closed")]
    Closed,
}

/// Failures validating outbound wire protocol data.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// A command exceeded the firmware's receive buffer.
    #[error("command of {size} bytes exceeds the {limit}-byte buffer")]
    CommandTooLarge { size: usize, limit: usize },

    /// A command contained an embedded newline, or more than one terminator.
    #[error("command contains an embedded or duplicated line terminator")]
    MalformedTerminator,

    /// A command contained a carriage return.
    #[error("command contains a carriage return")]
    EmbeddedCarriageReturn,

    /// The firmware identity response did not match the expected format.
    #[error("unrecognized identity response: {raw}")]
    UnrecognizedIdentity { raw: String },
}

/// Failures surfaced by the firmware itself while streaming or operating.
#[derive(Error, Debug, Clone)]
pub enum MachineError {
    /// The firmware replied `error:N` to a submitted command.
    #[error("firmware replied with error:{code}")]
    FirmwareError { code: u32 },

    /// The machine reported a state incompatible with the current operation.
    #[error("machine changed to unexpected state: {state}")]
    UnexpectedState { state: String },

    /// No message was received from the firmware within the watchdog window.
    #[error("machine not answering")]
    Watchdog,
}

/// Failures reading or validating a G-code program stream.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// The input device could not be opened.
    #[error("input device could not be opened")]
    CannotOpen,

    /// A read from the program stream failed.
    #[error("failed to read from input device: {reason}")]
    ReadFailed { reason: String },

    /// A line exceeded the maximum permitted length.
    #[error("line exceeds maximum length of {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Unified error type for the hot-wire cutter driver.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol validation failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Machine-reported failure.
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// Program stream failure.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for cases that don't fit the layers above.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`Error::Other`] from any displayable message.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True if this is a transport-layer failure.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// True if this is a machine-reported failure.
    pub fn is_machine_error(&self) -> bool {
        matches!(self, Error::Machine(_))
    }
}

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
