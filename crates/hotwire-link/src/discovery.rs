//! Periodic scanning for the hot-wire cutter's serial port.
//!
//! Scans on a fixed interval until a port matching the expected USB
//! vendor/product identifiers answers an identity probe correctly. The
//! found port is then handed off exactly once via [`PortDiscovery::take_port`].

use crate::constants::{MACHINE_PRODUCT_ID, MACHINE_VENDOR_ID};
use crate::port::{PortHandle, PortInfo, PortSource};
use hotwire_core::{DriverConfig, MachineIdentity};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

const IDENTITY_PROBE: &[u8] = b"$I\n";
const IDENTITY_READ_CHUNK: usize = 100;

/// Scans serial ports until one identifies itself as the expected machine.
pub struct PortDiscovery<S: PortSource> {
    source: S,
    scan_interval: Duration,
    max_attempts: u32,
    last_scan: Option<Instant>,
    adopted: Option<(MachineIdentity, Box<dyn PortHandle>)>,
    started: bool,
}

impl<S: PortSource> PortDiscovery<S> {
    pub fn new(source: S, config: &DriverConfig) -> Self {
        Self {
            source,
            scan_interval: Duration::from_millis(config.scan_interval_ms),
            max_attempts: config.max_identity_attempts,
            last_scan: None,
            adopted: None,
            started: false,
        }
    }

    /// Mark discovery as active. Returns `true` exactly once, the first call,
    /// so the caller can emit `ScanStarted` without risking a duplicate.
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    /// Drive one scan cycle if `scan_interval` has elapsed since the last one.
    /// Returns the adopted identity once a matching port answers correctly;
    /// afterwards this always returns `None` without scanning further.
    pub fn poll(&mut self, now: Instant) -> Option<MachineIdentity> {
        if self.adopted.is_some() {
            return None;
        }
        if let Some(last) = self.last_scan {
            if now.duration_since(last) < self.scan_interval {
                return None;
            }
        }
        self.last_scan = Some(now);

        for candidate in self.source.list() {
            if !candidate.matches_vendor_product(MACHINE_VENDOR_ID, MACHINE_PRODUCT_ID) {
                continue;
            }
            if let Some((identity, handle)) = self.probe(&candidate) {
                self.adopted = Some((identity.clone(), handle));
                return Some(identity);
            }
        }
        None
    }

    /// Take ownership of the adopted port. Returns `None` on every call after
    /// the first, or if nothing has been adopted yet.
    pub fn take_port(&mut self) -> Option<Box<dyn PortHandle>> {
        self.adopted.take().map(|(_, handle)| handle)
    }

    fn probe(&self, candidate: &PortInfo) -> Option<(MachineIdentity, Box<dyn PortHandle>)> {
        let mut handle = self.source.open(&candidate.name).ok()?;
        if handle.write(IDENTITY_PROBE).is_err() {
            return None;
        }

        let mut accumulated = Vec::new();
        let mut buf = [0u8; IDENTITY_READ_CHUNK];
        for _ in 0..self.max_attempts {
            match handle.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    accumulated.extend_from_slice(&buf[..n]);
                    if accumulated.ends_with(b"ok\r\n") {
                        let text = String::from_utf8_lossy(&accumulated);
                        if let Ok(identity) = MachineIdentity::parse(&text) {
                            return Some((identity, handle));
                        }
                        return None;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => continue,
                Err(_) => return None,
            }
        }
        None
    }
}
