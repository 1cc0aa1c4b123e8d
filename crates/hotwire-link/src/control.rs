//! Glue component: wires the domain objects together, owns the I/O thread
//! handoff, and exposes the only surface an embedding shell touches.

use crate::discovery::PortDiscovery;
use crate::link::{LinkEvent, MachineLink};
use crate::port::{PortHandle, SystemPortSource};
use crate::sender::CommandSender;
use crate::status::{StatusEvent, StatusMonitor};
use crate::streamer::GCodeStreamer;
use crate::wire::WireController;
use hotwire_core::events::{DriverEvent, EventDispatcher};
use hotwire_core::identity::MachineIdentity;
use hotwire_core::DriverConfig;
use std::cell::RefCell;
use std::io::{self, BufRead};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Messages ferried from the dedicated I/O thread into the domain loop.
enum IoEvent {
    PortFound(MachineIdentity),
    Inbound(Vec<u8>),
    PortError(String),
}

/// A [`PortHandle`] that proxies writes to the I/O thread over a channel
/// instead of touching the OS port directly. Lets [`MachineLink`] keep its
/// synchronous, single-owner API even though the real handle lives on
/// another thread; inbound bytes arrive separately as [`IoEvent::Inbound`]
/// and are fed in through [`ControlCore::pump`].
struct ChannelPort {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

impl PortHandle for ChannelPort {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread is gone"))?;
        Ok(data.len())
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

fn spawn_io_thread(
    config: DriverConfig,
    event_tx: crossbeam_channel::Sender<IoEvent>,
    write_rx: crossbeam_channel::Receiver<Vec<u8>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut discovery = PortDiscovery::new(SystemPortSource, &config);
        discovery.start();

        let mut port = loop {
            if let Some(identity) = discovery.poll(Instant::now()) {
                if event_tx.send(IoEvent::PortFound(identity)).is_err() {
                    return;
                }
                match discovery.take_port() {
                    Some(port) => break port,
                    None => return,
                }
            }
            thread::sleep(Duration::from_millis(100));
        };

        let mut buf = [0u8; 256];
        loop {
            while let Ok(bytes) = write_rx.try_recv() {
                if let Err(e) = port.write(&bytes) {
                    let _ = event_tx.send(IoEvent::PortError(e.to_string()));
                    return;
                }
            }
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if event_tx.send(IoEvent::Inbound(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    let _ = event_tx.send(IoEvent::PortError(e.to_string()));
                    return;
                }
            }
            if write_rx.is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
        }
    })
}

/// Owns every domain component and the operator-facing event bus. The only
/// type an embedding shell is expected to construct directly.
pub struct ControlCore {
    config: DriverConfig,
    link: Rc<RefCell<MachineLink>>,
    sender: Rc<RefCell<CommandSender>>,
    status: Rc<RefCell<StatusMonitor>>,
    wire: Rc<RefCell<WireController>>,
    streamer: Option<Rc<GCodeStreamer>>,
    events: EventDispatcher,
    io_rx: Option<crossbeam_channel::Receiver<IoEvent>>,
    write_tx: Option<crossbeam_channel::Sender<Vec<u8>>>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl ControlCore {
    pub fn new(config: DriverConfig) -> Self {
        let link = Rc::new(RefCell::new(MachineLink::new(config.char_send_delay_us)));
        let sender = Rc::new(RefCell::new(CommandSender::new(link.clone())));
        let status = Rc::new(RefCell::new(StatusMonitor::new(link.clone(), &config)));
        let wire = Rc::new(RefCell::new(WireController::new(link.clone(), sender.clone())));
        Self {
            config,
            link,
            sender,
            status,
            wire,
            streamer: None,
            events: EventDispatcher::default(),
            io_rx: None,
            write_tx: None,
            io_thread: None,
        }
    }

    /// Subscribe to the operator-facing event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Spawn the I/O thread and begin scanning for the controller. A no-op
    /// if discovery has already been started.
    pub fn start_discovery(&mut self) {
        if self.io_thread.is_some() {
            return;
        }
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        self.io_thread = Some(spawn_io_thread(self.config, event_tx, write_rx));
        self.io_rx = Some(event_rx);
        self.write_tx = Some(write_tx);
        self.events.publish(DriverEvent::ScanStarted);
    }

    /// Drain and process everything currently queued from the I/O thread.
    /// Returns how many messages were processed. This is the single point
    /// where bytes cross from the I/O thread into the domain objects.
    pub fn pump(&mut self) -> usize {
        let pending: Vec<IoEvent> = match &self.io_rx {
            Some(rx) => rx.try_iter().collect(),
            None => return 0,
        };
        let count = pending.len();
        for event in pending {
            self.handle_io_event(event);
        }
        count
    }

    /// Drive cooperative timers (status polling and watchdog) that don't
    /// depend on inbound bytes. Call alongside [`Self::pump`].
    pub fn tick(&mut self) {
        let now = Instant::now();
        let status_events = self.status.borrow_mut().tick(now);
        for event in status_events {
            self.dispatch_status_event(event);
        }
    }

    fn handle_io_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::PortFound(identity) => {
                let tx = self.write_tx.clone().expect("write channel exists once discovery has started");
                let link_event = self.link.borrow_mut().adopt(Box::new(ChannelPort { tx }));
                self.events.publish(DriverEvent::PortFound(identity));
                self.dispatch_link_event(&link_event, Instant::now());
            }
            IoEvent::Inbound(bytes) => {
                let now = Instant::now();
                let link_events = self.link.borrow_mut().feed(&bytes);
                for link_event in link_events {
                    self.dispatch_link_event(&link_event, now);
                }
            }
            IoEvent::PortError(reason) => {
                let link_event = self.link.borrow_mut().close_with_error(reason);
                self.dispatch_link_event(&link_event, Instant::now());
            }
        }
    }

    fn dispatch_link_event(&mut self, event: &LinkEvent, now: Instant) {
        match event {
            LinkEvent::DataSent(bytes) => {
                self.events.publish(DriverEvent::DataSent(bytes.clone()));
            }
            LinkEvent::DataReceived(bytes) => {
                self.events.publish(DriverEvent::DataReceived(bytes.clone()));
            }
            LinkEvent::MessageReceived(line) => {
                self.events.publish(DriverEvent::MessageReceived(line.clone()));
            }
            LinkEvent::PortClosed => {
                self.events.publish(DriverEvent::PortClosed);
            }
            LinkEvent::PortClosedWithError(reason) => {
                self.events.publish(DriverEvent::PortClosedWithError(reason.clone()));
            }
            LinkEvent::MachineInitialized => {
                self.events.publish(DriverEvent::MachineInitialized);
                let wire_events = self.wire.borrow_mut().resync_after_reinitialization();
                for wire_event in wire_events {
                    self.events.publish(wire_event.into());
                }
            }
        }

        // Dispatched only after the borrow is released: a notification can
        // call straight back into the sender (e.g. a streamer submitting its
        // next line), which would panic against a still-held `borrow_mut()`.
        let notifications = self.sender.borrow_mut().handle_link_event(event);
        crate::sender::dispatch_all(notifications);

        let status_events = self.status.borrow_mut().handle_link_event(event, now);
        for status_event in status_events {
            self.dispatch_status_event(status_event);
        }

        if let Some(streamer) = self.streamer.clone() {
            if matches!(event, LinkEvent::PortClosed | LinkEvent::PortClosedWithError(_)) {
                streamer.interrupt();
            }
            self.drain_streamer_events(streamer);
        }
    }

    fn dispatch_status_event(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::StateChanged(state) => {
                self.events.publish(DriverEvent::StateChanged(state));
                if let Some(streamer) = self.streamer.clone() {
                    streamer.state_changed(state);
                    self.drain_streamer_events(streamer);
                }
            }
            StatusEvent::StatusReport(report) => {
                self.events.publish(DriverEvent::StatusReport(report));
            }
            StatusEvent::WatchdogExpired => {
                let link_event = self.link.borrow_mut().close_with_error("Machine not answering");
                self.dispatch_link_event(&link_event, Instant::now());
            }
        }
    }

    fn drain_streamer_events(&mut self, streamer: Rc<GCodeStreamer>) {
        for event in streamer.drain_events() {
            self.events.publish(event);
        }
        if streamer.is_ended() {
            self.streamer = None;
        }
    }

    /// Begin streaming a program. Replaces (interrupting) any run in progress.
    pub fn stream_program(&mut self, reader: io::Result<Box<dyn BufRead>>) {
        if let Some(previous) = self.streamer.take() {
            previous.interrupt();
            self.drain_streamer_events(previous);
        }
        let current_state = self.status.borrow().state();
        let hard_reset_delay = Duration::from_millis(self.config.hard_reset_delay_ms);
        let streamer = GCodeStreamer::start(
            self.link.clone(),
            self.sender.clone(),
            self.wire.clone(),
            current_state,
            reader,
            hard_reset_delay,
        );
        self.drain_streamer_events(streamer.clone());
        if !streamer.is_ended() {
            self.streamer = Some(streamer);
        }
    }

    pub fn interrupt_streaming(&mut self) {
        if let Some(streamer) = self.streamer.clone() {
            streamer.interrupt();
            self.drain_streamer_events(streamer);
        }
    }

    pub fn set_temperature(&mut self, celsius: f64) {
        let events = self.wire.borrow_mut().set_temperature(celsius);
        for event in events {
            self.events.publish(event.into());
        }
    }

    pub fn set_realtime_temperature(&mut self, celsius: f64) {
        let events = self.wire.borrow_mut().set_realtime_temperature(celsius);
        for event in events {
            self.events.publish(event.into());
        }
    }

    pub fn reset_realtime_temperature(&mut self) {
        let events = self.wire.borrow_mut().reset_realtime_temperature();
        for event in events {
            self.events.publish(event.into());
        }
    }

    pub fn feed_hold(&mut self) {
        let event = self.link.borrow_mut().feed_hold();
        if let Some(event) = event {
            self.dispatch_link_event(&event, Instant::now());
        }
    }

    pub fn resume(&mut self) {
        let event = self.link.borrow_mut().resume();
        if let Some(event) = event {
            self.dispatch_link_event(&event, Instant::now());
        }
    }

    pub fn soft_reset(&mut self) {
        let event = self.link.borrow_mut().soft_reset();
        if let Some(event) = event {
            self.dispatch_link_event(&event, Instant::now());
        }
    }

    pub fn hard_reset(&mut self) {
        let settle = Duration::from_millis(self.config.hard_reset_delay_ms);
        let events = self.link.borrow_mut().hard_reset(settle);
        for event in events {
            self.dispatch_link_event(&event, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_core_has_no_active_streamer() {
        let core = ControlCore::new(DriverConfig::default());
        assert!(core.streamer.is_none());
        assert_eq!(core.events.subscriber_count(), 0);
    }

    #[test]
    fn pump_without_discovery_is_a_no_op() {
        let mut core = ControlCore::new(DriverConfig::default());
        assert_eq!(core.pump(), 0);
    }

    #[test]
    fn subscribing_increments_subscriber_count() {
        let core = ControlCore::new(DriverConfig::default());
        let _rx = core.subscribe();
        assert_eq!(core.events.subscriber_count(), 1);
    }
}
