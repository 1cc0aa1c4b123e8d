//! Serial link, command streaming, and wire control for the hot-wire cutter driver.
//!
//! [`control::ControlCore`] is the only type an embedding shell needs to
//! construct; everything else in this crate is an internal domain object it
//! wires together.

pub mod constants;
pub mod control;
pub mod discovery;
pub mod link;
pub mod port;
pub mod sender;
pub mod status;
pub mod streamer;
pub mod wire;

pub use control::ControlCore;
pub use link::{LinkEvent, MachineLink};
pub use port::{PortHandle, PortInfo, PortSource, SystemPortSource};
pub use sender::{CommandSender, CommandSenderListener};
pub use status::{StatusEvent, StatusMonitor};
pub use streamer::GCodeStreamer;
pub use wire::{WireController, WireEvent};
