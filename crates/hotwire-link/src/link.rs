//! Byte framing, immediate commands, and reset for an adopted serial port.
//!
//! `MachineLink` owns the serial handle once a port has been adopted by
//! discovery. Reading is push-based: the owning I/O thread calls
//! [`MachineLink::feed`] with whatever bytes just arrived and gets back the
//! framing events (`MessageReceived` per `\r\n`-delimited line) for the
//! caller to fan out to the rest of the domain objects. Writing is
//! synchronous and goes straight to the OS handle.

use crate::constants::{CYCLE_RESUME, FEED_HOLD, HARD_RESET, SOFT_RESET};
use crate::port::PortHandle;
use hotwire_core::error::TransportError;
use std::thread;
use std::time::Duration;

/// Events produced by feeding raw bytes through the link, or by an
/// immediate command that changes the link's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    DataSent(Vec<u8>),
    DataReceived(Vec<u8>),
    MessageReceived(String),
    PortClosed,
    PortClosedWithError(String),
    MachineInitialized,
}

/// Owns the adopted serial port and assembles `\r\n`-delimited messages.
pub struct MachineLink {
    port: Option<Box<dyn PortHandle>>,
    inbound: Vec<u8>,
    char_send_delay: Duration,
}

impl MachineLink {
    pub fn new(char_send_delay_us: u64) -> Self {
        Self { port: None, inbound: Vec::new(), char_send_delay: Duration::from_micros(char_send_delay_us) }
    }

    /// Take ownership of a freshly discovered port. Returns the
    /// `MachineInitialized` event that always follows adoption.
    pub fn adopt(&mut self, port: Box<dyn PortHandle>) -> LinkEvent {
        self.port = Some(port);
        self.inbound.clear();
        LinkEvent::MachineInitialized
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Write raw bytes to the port. A silent no-op if no port is owned.
    pub fn write_data(&mut self, bytes: &[u8]) -> Option<LinkEvent> {
        let port = self.port.as_mut()?;
        let result = if self.char_send_delay.is_zero() {
            port.write(bytes).map(|_| ())
        } else {
            bytes.iter().try_for_each(|&b| {
                port.write(&[b])?;
                thread::sleep(self.char_send_delay);
                Ok(())
            })
        };
        match result {
            Ok(()) => Some(LinkEvent::DataSent(bytes.to_vec())),
            Err(e) => {
                self.port = None;
                Some(LinkEvent::PortClosedWithError(e.to_string()))
            }
        }
    }

    /// Write a command line, appending `\n`.
    pub fn write_line(&mut self, bytes: &[u8]) -> Option<LinkEvent> {
        let mut line = bytes.to_vec();
        line.push(b'\n');
        self.write_data(&line)
    }

    pub fn feed_hold(&mut self) -> Option<LinkEvent> {
        self.write_data(&[FEED_HOLD])
    }

    pub fn resume(&mut self) -> Option<LinkEvent> {
        self.write_data(&[CYCLE_RESUME])
    }

    pub fn soft_reset(&mut self) -> Option<LinkEvent> {
        self.write_data(&[SOFT_RESET])
    }

    /// Issue a hard reset, block for the configured settling delay, then
    /// report reinitialization. The sleep is deliberate: nothing downstream
    /// is meaningful until the controller finishes restarting.
    pub fn hard_reset(&mut self, settle: Duration) -> Vec<LinkEvent> {
        let mut events: Vec<LinkEvent> = self.write_data(&[HARD_RESET]).into_iter().collect();
        if self.port.is_some() {
            thread::sleep(settle);
            events.push(LinkEvent::MachineInitialized);
        }
        events
    }

    /// Feed newly arrived bytes and return the resulting link events, in order:
    /// one `DataReceived` for the whole chunk, then one `MessageReceived` per
    /// completed `\r\n`-terminated line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LinkEvent> {
        if bytes.is_empty() {
            return Vec::new();
        }
        let mut events = vec![LinkEvent::DataReceived(bytes.to_vec())];
        self.inbound.extend_from_slice(bytes);

        while let Some(pos) = find_crlf(&self.inbound) {
            let line: Vec<u8> = self.inbound.drain(..pos + 2).collect();
            let message = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
            events.push(LinkEvent::MessageReceived(message));
        }
        events
    }

    pub fn close(&mut self) -> Option<LinkEvent> {
        if self.port.take().is_some() {
            Some(LinkEvent::PortClosed)
        } else {
            None
        }
    }

    pub fn close_with_error(&mut self, reason: impl Into<String>) -> LinkEvent {
        self.port = None;
        LinkEvent::PortClosedWithError(reason.into())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl From<TransportError> for LinkEvent {
    fn from(err: TransportError) -> Self {
        LinkEvent::PortClosedWithError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortHandle;
    use std::io;

    struct LoopbackPort {
        written: Vec<u8>,
    }

    impl PortHandle for LoopbackPort {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn adopt_emits_machine_initialized() {
        let mut link = MachineLink::new(0);
        let event = link.adopt(Box::new(LoopbackPort { written: Vec::new() }));
        assert_eq!(event, LinkEvent::MachineInitialized);
        assert!(link.is_open());
    }

    #[test]
    fn write_before_adoption_is_a_silent_no_op() {
        let mut link = MachineLink::new(0);
        assert!(link.write_data(b"M3\n").is_none());
    }

    #[test]
    fn feed_splits_multiple_messages() {
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(LoopbackPort { written: Vec::new() }));

        let events = link.feed(b"ok\r\nerror:3\r\n");
        assert_eq!(
            events,
            vec![
                LinkEvent::DataReceived(b"ok\r\nerror:3\r\n".to_vec()),
                LinkEvent::MessageReceived("ok".to_string()),
                LinkEvent::MessageReceived("error:3".to_string()),
            ]
        );
    }

    #[test]
    fn feed_holds_partial_message_across_calls() {
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(LoopbackPort { written: Vec::new() }));

        let first = link.feed(b"<Idle|MPos");
        assert_eq!(first, vec![LinkEvent::DataReceived(b"<Idle|MPos".to_vec())]);

        let second = link.feed(b":0,0,0>\r\n");
        assert_eq!(
            second,
            vec![
                LinkEvent::DataReceived(b":0,0,0>\r\n".to_vec()),
                LinkEvent::MessageReceived("<Idle|MPos:0,0,0>".to_string()),
            ]
        );
    }
}
