//! Serial port abstraction.
//!
//! [`PortSource`] is the injection seam that makes [`crate::discovery::PortDiscovery`]
//! testable without real hardware: production code uses [`SystemPortSource`],
//! tests supply an in-memory fake.

use crate::constants::BAUD_RATE;
use hotwire_core::error::TransportError;
use std::io;
use std::time::Duration;

/// A candidate serial port surfaced by port enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl PortInfo {
    /// True if this port's USB identifiers match the machine's.
    pub fn matches_vendor_product(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == Some(vendor_id) && self.product_id == Some(product_id)
    }
}

/// A single open serial connection. Implementations need not be `Sync`; the
/// link is only ever touched from the owning I/O thread.
pub trait PortHandle: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl PortHandle for Box<dyn serialport::SerialPort> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        io::Write::write(self.as_mut(), data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self.as_mut(), buf)
    }
}

/// Lists candidate ports and opens them by name. Abstracted so discovery and
/// the link can be driven by a fake port source in tests.
pub trait PortSource: Send {
    fn list(&self) -> Vec<PortInfo>;
    fn open(&self, name: &str) -> Result<Box<dyn PortHandle>, TransportError>;
}

/// Production [`PortSource`] backed by the OS's serial subsystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortSource;

impl PortSource for SystemPortSource {
    fn list(&self) -> Vec<PortInfo> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                let (vendor_id, product_id) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (Some(info.vid), Some(info.pid)),
                    _ => (None, None),
                };
                PortInfo { name: p.port_name, vendor_id, product_id }
            })
            .collect()
    }

    fn open(&self, name: &str) -> Result<Box<dyn PortHandle>, TransportError> {
        serialport::new(name, BAUD_RATE)
            .flow_control(serialport::FlowControl::Hardware)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(1000))
            .open()
            .map(|port| Box::new(port) as Box<dyn PortHandle>)
            .map_err(|e| TransportError::FailedToOpen { port: name.to_string(), reason: e.to_string() })
    }
}
