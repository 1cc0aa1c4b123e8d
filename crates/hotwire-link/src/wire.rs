//! Hot-wire on/off and temperature control.
//!
//! Absolute temperature is set with an `S<value>` G-code word; the real-time
//! override is a discrete percentage in `[10, 200]` nudged by single-byte
//! immediate commands, `coarse = diff / 10` steps of 10% followed by
//! `fine = diff % 10` steps of 1%.

use crate::constants::{
    COARSE_TEMPERATURE_DECREMENT, COARSE_TEMPERATURE_INCREMENT, FINE_TEMPERATURE_DECREMENT,
    FINE_TEMPERATURE_INCREMENT, RESET_OVERRIDE,
};
use crate::link::MachineLink;
use crate::sender::CommandSender;
use hotwire_core::events::DriverEvent;
use std::cell::RefCell;
use std::rc::Rc;

const MIN_REALTIME_PERCENT: u16 = 10;
const MAX_REALTIME_PERCENT: u16 = 200;
const DEFAULT_REALTIME_PERCENT: u16 = 100;

/// Outcome of a wire-controller operation. Callers fold these into whichever
/// event surface they own (the operator-facing bus for [`crate::control::ControlCore`],
/// the streaming run's own event buffer for [`crate::streamer::GCodeStreamer`]).
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    WireOn,
    WireOff,
    TemperatureChanged(f64),
}

impl From<WireEvent> for DriverEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::WireOn => DriverEvent::WireOn,
            WireEvent::WireOff => DriverEvent::WireOff,
            WireEvent::TemperatureChanged(value) => DriverEvent::TemperatureChanged(value),
        }
    }
}

/// Controls the hot wire's on/off state and temperature.
pub struct WireController {
    link: Rc<RefCell<MachineLink>>,
    sender: Rc<RefCell<CommandSender>>,
    wire_on: bool,
    base_temp: f64,
    realtime_percent: u16,
}

impl WireController {
    pub fn new(link: Rc<RefCell<MachineLink>>, sender: Rc<RefCell<CommandSender>>) -> Self {
        Self {
            link,
            sender,
            wire_on: false,
            base_temp: 0.0,
            realtime_percent: DEFAULT_REALTIME_PERCENT,
        }
    }

    pub fn is_on(&self) -> bool {
        self.wire_on
    }

    pub fn base_temperature(&self) -> f64 {
        self.base_temp
    }

    /// Effective temperature after applying the current real-time override.
    pub fn effective_temperature(&self) -> f64 {
        self.base_temp * self.realtime_percent as f64 / 100.0
    }

    pub fn min_realtime_temperature(&self) -> f64 {
        self.base_temp * MIN_REALTIME_PERCENT as f64 / 100.0
    }

    pub fn max_realtime_temperature(&self) -> f64 {
        self.base_temp * MAX_REALTIME_PERCENT as f64 / 100.0
    }

    /// Set a new absolute base temperature, clearing any active override.
    pub fn set_temperature(&mut self, celsius: f64) -> Vec<WireEvent> {
        self.link.borrow_mut().write_data(&[RESET_OVERRIDE]);
        self.realtime_percent = DEFAULT_REALTIME_PERCENT;
        self.base_temp = celsius;
        let command = format!("S{}", celsius.round() as i64);
        let _ = self.sender.borrow_mut().send_command(command.into_bytes(), None);
        vec![WireEvent::TemperatureChanged(self.effective_temperature())]
    }

    /// Nudge the real-time override towards the requested temperature.
    pub fn set_realtime_temperature(&mut self, celsius: f64) -> Vec<WireEvent> {
        if self.base_temp == 0.0 {
            return Vec::new();
        }
        let target = ((celsius / self.base_temp) * 100.0).round() as i32;
        let target = target.clamp(MIN_REALTIME_PERCENT as i32, MAX_REALTIME_PERCENT as i32) as u16;
        if target == self.realtime_percent {
            return Vec::new();
        }

        let increasing = target > self.realtime_percent;
        let diff = if increasing { target - self.realtime_percent } else { self.realtime_percent - target };
        let coarse = diff / 10;
        let fine = diff % 10;

        let (coarse_byte, fine_byte) = if increasing {
            (COARSE_TEMPERATURE_INCREMENT, FINE_TEMPERATURE_INCREMENT)
        } else {
            (COARSE_TEMPERATURE_DECREMENT, FINE_TEMPERATURE_DECREMENT)
        };

        let mut bytes = Vec::with_capacity((coarse + fine) as usize);
        bytes.extend(std::iter::repeat(coarse_byte).take(coarse as usize));
        bytes.extend(std::iter::repeat(fine_byte).take(fine as usize));
        self.link.borrow_mut().write_data(&bytes);

        self.realtime_percent = target;
        vec![WireEvent::TemperatureChanged(self.effective_temperature())]
    }

    /// Clear the real-time override, returning to the base temperature.
    pub fn reset_realtime_temperature(&mut self) -> Vec<WireEvent> {
        if self.realtime_percent == DEFAULT_REALTIME_PERCENT {
            return Vec::new();
        }
        self.link.borrow_mut().write_data(&[RESET_OVERRIDE]);
        self.realtime_percent = DEFAULT_REALTIME_PERCENT;
        vec![WireEvent::TemperatureChanged(self.effective_temperature())]
    }

    /// Turn the wire on. Idempotent; produces `WireOn` only on an actual transition.
    pub fn switch_wire_on(&mut self) -> Vec<WireEvent> {
        if self.wire_on {
            return Vec::new();
        }
        self.wire_on = true;
        let _ = self.sender.borrow_mut().send_command(b"M3".to_vec(), None);
        vec![WireEvent::WireOn]
    }

    /// Turn the wire off. Idempotent; produces `WireOff` only on an actual transition.
    pub fn switch_wire_off(&mut self) -> Vec<WireEvent> {
        if !self.wire_on {
            return Vec::new();
        }
        self.wire_on = false;
        let _ = self.sender.borrow_mut().send_command(b"M5".to_vec(), None);
        vec![WireEvent::WireOff]
    }

    /// Resync after the controller reinitializes: force the wire off, then
    /// reapply the current base temperature so the override is cleared too.
    pub fn resync_after_reinitialization(&mut self) -> Vec<WireEvent> {
        let mut events = Vec::new();
        if self.wire_on {
            self.wire_on = false;
            events.push(WireEvent::WireOff);
        }
        let current = self.base_temp;
        events.extend(self.set_temperature(current));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortHandle;
    use std::io;
    use std::sync::{Arc, Mutex};

    struct SinkPort;
    impl PortHandle for SinkPort {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    /// Records every byte written to it, shared with the test via `Arc<Mutex<_>>`
    /// so the recorded bytes are still readable after the port is boxed away.
    struct RecordingPort {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl PortHandle for RecordingPort {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn wire_controller() -> WireController {
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(SinkPort));
        let link = Rc::new(RefCell::new(link));
        let sender = Rc::new(RefCell::new(CommandSender::new(link.clone())));
        WireController::new(link, sender)
    }

    fn recording_wire_controller() -> (Arc<Mutex<Vec<u8>>>, WireController) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(RecordingPort { written: written.clone() }));
        let link = Rc::new(RefCell::new(link));
        let sender = Rc::new(RefCell::new(CommandSender::new(link.clone())));
        (written, WireController::new(link, sender))
    }

    #[test]
    fn realtime_override_stays_within_bounds() {
        let mut wire = wire_controller();
        wire.set_temperature(40.0);
        wire.set_realtime_temperature(1000.0);
        assert!(wire.effective_temperature() <= wire.max_realtime_temperature() + 0.001);
    }

    #[test]
    fn realtime_down_step_matches_expected_delta() {
        let mut wire = wire_controller();
        wire.set_temperature(40.0);
        let events = wire.set_realtime_temperature(30.0);
        // 30/40 = 75%, a 25-point drop from 100%: 2 coarse, 5 fine steps.
        let WireEvent::TemperatureChanged(effective) = events.into_iter().next().unwrap() else {
            panic!("expected a TemperatureChanged event");
        };
        assert_eq!((effective * 100.0 / 40.0).round() as i32, 75);
    }

    #[test]
    fn realtime_down_step_writes_expected_byte_sequence() {
        let (written, mut wire) = recording_wire_controller();
        wire.set_temperature(40.0);
        written.lock().unwrap().clear();

        wire.set_realtime_temperature(30.0);

        assert_eq!(
            *written.lock().unwrap(),
            vec![
                COARSE_TEMPERATURE_DECREMENT,
                COARSE_TEMPERATURE_DECREMENT,
                FINE_TEMPERATURE_DECREMENT,
                FINE_TEMPERATURE_DECREMENT,
                FINE_TEMPERATURE_DECREMENT,
                FINE_TEMPERATURE_DECREMENT,
                FINE_TEMPERATURE_DECREMENT,
            ]
        );
    }

    #[test]
    fn switching_wire_on_is_idempotent() {
        let mut wire = wire_controller();
        assert_eq!(wire.switch_wire_on(), vec![WireEvent::WireOn]);
        assert!(wire.switch_wire_on().is_empty());
        assert!(wire.is_on());
    }

    #[test]
    fn resync_forces_wire_off_and_clears_override() {
        let mut wire = wire_controller();
        wire.set_temperature(50.0);
        wire.switch_wire_on();
        wire.set_realtime_temperature(60.0);

        let events = wire.resync_after_reinitialization();

        assert!(events.contains(&WireEvent::WireOff));
        assert!(!wire.is_on());
        assert_eq!(wire.effective_temperature(), 50.0);
    }
}
