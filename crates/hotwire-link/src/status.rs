//! Periodic status polling, state decoding, and the silence watchdog.

use crate::constants::STATUS_QUERY;
use crate::link::{LinkEvent, MachineLink};
use hotwire_core::state::{MachineState, StatusReport};
use hotwire_core::DriverConfig;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Outcome of feeding a link event through the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    StateChanged(MachineState),
    StatusReport(StatusReport),
    WatchdogExpired,
}

/// Polls `?` on an interval and decodes `<State|...>` frames, closing the
/// link if the firmware goes silent for too long.
pub struct StatusMonitor {
    link: Rc<RefCell<MachineLink>>,
    polling_interval: Duration,
    watchdog_delay: Duration,
    state: MachineState,
    last_poll: Option<Instant>,
    last_message: Option<Instant>,
    active: bool,
}

impl StatusMonitor {
    pub fn new(link: Rc<RefCell<MachineLink>>, config: &DriverConfig) -> Self {
        Self {
            link,
            polling_interval: Duration::from_millis(config.polling_interval_ms),
            watchdog_delay: Duration::from_millis(config.watchdog_delay_ms),
            state: MachineState::Unknown,
            last_poll: None,
            last_message: None,
            active: false,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// React to a link event. Returns `StateChanged` only on an actual
    /// transition, and `StatusReport` whenever supplemental fields decode,
    /// independent of whether the state itself changed.
    pub fn handle_link_event(&mut self, event: &LinkEvent, now: Instant) -> Vec<StatusEvent> {
        match event {
            LinkEvent::MachineInitialized => {
                self.active = true;
                self.last_message = Some(now);
                self.last_poll = None;
                self.transition_to(MachineState::Unknown)
            }
            LinkEvent::MessageReceived(message) => {
                self.last_message = Some(now);
                self.decode_status(message)
            }
            LinkEvent::PortClosed | LinkEvent::PortClosedWithError(_) => {
                self.active = false;
                self.transition_to(MachineState::Unknown)
            }
            _ => Vec::new(),
        }
    }

    fn decode_status(&mut self, message: &str) -> Vec<StatusEvent> {
        let Some(inner) = message.strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
            return Vec::new();
        };
        let Some((state_field, rest)) = inner.split_once('|') else {
            return self.transition_to(MachineState::parse(inner));
        };

        let mut events = self.transition_to(MachineState::parse(state_field));
        events.push(StatusEvent::StatusReport(StatusReport::parse(rest)));
        events
    }

    fn transition_to(&mut self, new_state: MachineState) -> Vec<StatusEvent> {
        if new_state == self.state {
            return Vec::new();
        }
        self.state = new_state;
        vec![StatusEvent::StateChanged(new_state)]
    }

    /// Drive timers: issue a `?` poll if due, and report watchdog expiry if
    /// the link has been silent for too long. Called cooperatively by
    /// whoever drives the domain loop (no background timer thread).
    pub fn tick(&mut self, now: Instant) -> Vec<StatusEvent> {
        if !self.active {
            return Vec::new();
        }

        if let Some(last_message) = self.last_message {
            if now.duration_since(last_message) >= self.watchdog_delay {
                self.active = false;
                return vec![StatusEvent::WatchdogExpired];
            }
        }

        let due = match self.last_poll {
            None => true,
            Some(last) => now.duration_since(last) >= self.polling_interval,
        };
        if due {
            self.last_poll = Some(now);
            self.link.borrow_mut().write_data(&[STATUS_QUERY]);
        }
        Vec::new()
    }
}
