//! Shared types for the hot-wire cutter driver.
//!
//! Provides the error hierarchy, machine identity/state/status types, the
//! operator-facing event bus, command framing, and driver configuration used
//! by `hotwire-link`.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod state;

pub use command::{Command, CommandId, GRBL_BUFFER_SIZE};
pub use config::DriverConfig;
pub use error::{Error, MachineError, ProtocolError, Result, StreamError, TransportError};
pub use events::{DriverEvent, EventDispatcher, StreamEndReason};
pub use identity::MachineIdentity;
pub use state::{FeedSpindleState, MachinePosition, MachineState, StatusReport, WorkCoordinateOffset};
