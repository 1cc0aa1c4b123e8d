//! Orchestrates streaming a whole G-code program.
//!
//! Drives the command sender line by line, watches the reported machine
//! state, and declares the run complete only once the stream has reached
//! its end, at least one `Run` has been observed, every submitted command
//! has been acknowledged, and the machine has returned to `Idle`.

use crate::constants::MAX_QUEUED_COMMANDS;
use crate::link::MachineLink;
use crate::sender::{dispatch_all, CommandSender, CommandSenderListener};
use crate::wire::WireController;
use hotwire_core::command::CommandId;
use hotwire_core::error::StreamError;
use hotwire_core::events::{DriverEvent, StreamEndReason};
use hotwire_core::state::MachineState;
use std::cell::RefCell;
use std::io::BufRead;
use std::rc::{Rc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Armed,
    WaitingIdle,
    Priming,
    Running,
    Ended,
}

struct Inner {
    reader: Option<Box<dyn BufRead>>,
    phase: Phase,
    expected_acks: u32,
    has_run: bool,
    machine_state: MachineState,
    ended: bool,
    events: Vec<DriverEvent>,
}

/// Drives one streaming run of a G-code program.
///
/// Constructed fresh per run; held as `Rc<GCodeStreamer>` so it can register
/// itself as a weak [`CommandSenderListener`].
pub struct GCodeStreamer {
    link: Rc<RefCell<MachineLink>>,
    sender: Rc<RefCell<CommandSender>>,
    wire: Rc<RefCell<WireController>>,
    inner: RefCell<Inner>,
    hard_reset_delay: Duration,
    self_weak: Weak<GCodeStreamer>,
}

impl GCodeStreamer {
    /// Begin a streaming run. `reader` is `Err` if the input device could
    /// not even be opened, matching the `Armed` -> `open-fail` transition.
    /// `hard_reset_delay` is the settling delay used on any reset this run
    /// triggers, taken from the driver's configuration.
    pub fn start(
        link: Rc<RefCell<MachineLink>>,
        sender: Rc<RefCell<CommandSender>>,
        wire: Rc<RefCell<WireController>>,
        current_state: MachineState,
        reader: std::io::Result<Box<dyn BufRead>>,
        hard_reset_delay: Duration,
    ) -> Rc<Self> {
        let streamer = Rc::new_cyclic(|weak| Self {
            link,
            sender,
            wire,
            hard_reset_delay,
            inner: RefCell::new(Inner {
                reader: None,
                phase: Phase::Armed,
                expected_acks: 0,
                has_run: false,
                machine_state: current_state,
                ended: false,
                events: vec![DriverEvent::StreamingStarted],
            }),
            self_weak: weak.clone(),
        });

        match reader {
            Ok(reader) => {
                let mut inner = streamer.inner.borrow_mut();
                inner.reader = Some(reader);
                inner.phase = Phase::WaitingIdle;
                drop(inner);
                if current_state == MachineState::Idle {
                    streamer.enter_priming();
                }
            }
            Err(_) => streamer.terminate(StreamEndReason::StreamError, StreamError::CannotOpen.to_string()),
        }
        streamer
    }

    /// Drain and return every event produced since the last call.
    pub fn drain_events(&self) -> Vec<DriverEvent> {
        std::mem::take(&mut self.inner.borrow_mut().events)
    }

    pub fn is_ended(&self) -> bool {
        self.inner.borrow().ended
    }

    /// React to a machine state change reported by the status monitor.
    pub fn state_changed(self: &Rc<Self>, state: MachineState) {
        let phase = self.inner.borrow().phase;
        if phase == Phase::Ended {
            return;
        }
        self.inner.borrow_mut().machine_state = state;

        match phase {
            Phase::WaitingIdle => {
                if state == MachineState::Idle {
                    self.enter_priming();
                } else if state != MachineState::Unknown && state != MachineState::Hold {
                    self.terminate_unexpected_state(state);
                }
            }
            Phase::Priming | Phase::Running => {
                if state == MachineState::Run {
                    self.inner.borrow_mut().has_run = true;
                } else if state == MachineState::Idle {
                    self.maybe_finish();
                } else if state.is_unexpected_during_stream() {
                    self.terminate_unexpected_state(state);
                }
            }
            Phase::Armed | Phase::Ended => {}
        }
    }

    /// Explicit user cancellation.
    pub fn interrupt(self: &Rc<Self>) {
        self.terminate(StreamEndReason::UserInterrupted, "User interrupted streaming".to_string());
    }

    fn enter_priming(self: &Rc<Self>) {
        self.inner.borrow_mut().phase = Phase::Priming;
        let wire_events = self.wire.borrow_mut().switch_wire_on();
        self.inner.borrow_mut().events.extend(wire_events.into_iter().map(DriverEvent::from));

        let Some(line) = self.next_line() else {
            self.finish();
            return;
        };
        self.submit_line(line);
    }

    fn next_line(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        let reader = inner.reader.as_mut()?;
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).as_bytes().to_vec()),
            Err(_) => None,
        }
    }

    fn submit_line(self: &Rc<Self>, line: Vec<u8>) {
        let listener: Weak<dyn CommandSenderListener> = {
            let concrete: Rc<dyn CommandSenderListener> = self.clone();
            Rc::downgrade(&concrete)
        };
        // The sender's `borrow_mut()` is released before `notifications` is
        // dispatched below: a `command_sent` callback re-enters this streamer
        // and may itself borrow the sender (see `pump_more`), which would
        // panic if that borrow were still held.
        let result = self.sender.borrow_mut().send_command(line, Some(listener));
        match result {
            Ok((_, notifications)) => {
                self.inner.borrow_mut().expected_acks += 1;
                dispatch_all(notifications);
            }
            Err(_) => self.terminate(StreamEndReason::StreamError, "Rejected malformed G-code line".to_string()),
        }
    }

    fn pump_more(self: &Rc<Self>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == Phase::Priming {
                inner.phase = Phase::Running;
            }
        }
        loop {
            let pending = self.sender.borrow().pending_commands();
            if pending >= MAX_QUEUED_COMMANDS {
                break;
            }
            let Some(line) = self.next_line() else {
                self.maybe_finish();
                break;
            };
            self.submit_line(line);
        }
    }

    fn maybe_finish(self: &Rc<Self>) {
        let ready = {
            let inner = self.inner.borrow();
            inner.reader.is_none() || matches!(inner.phase, Phase::Running | Phase::Priming)
        };
        if !ready {
            return;
        }
        let reader_absent = self.inner.borrow().reader.is_none();
        let stream_at_end = reader_absent || self.at_end();
        let (expected_acks, has_run, machine_state) = {
            let inner = self.inner.borrow();
            (inner.expected_acks, inner.has_run, inner.machine_state)
        };
        if stream_at_end && has_run && expected_acks == 0 && machine_state == MachineState::Idle {
            self.finish();
        }
    }

    fn at_end(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.reader.as_mut() {
            None => true,
            Some(reader) => reader.fill_buf().map(|buf| buf.is_empty()).unwrap_or(true),
        }
    }

    fn finish(self: &Rc<Self>) {
        let wire_events = self.wire.borrow_mut().switch_wire_off();
        {
            let mut inner = self.inner.borrow_mut();
            inner.reader = None;
            inner.phase = Phase::Ended;
            inner.ended = true;
            inner.events.extend(wire_events.into_iter().map(DriverEvent::from));
            inner
                .events
                .push(DriverEvent::StreamingEnded(StreamEndReason::Completed, "Program completed".to_string()));
        }
    }

    fn terminate_unexpected_state(self: &Rc<Self>, state: MachineState) {
        self.terminate(StreamEndReason::MachineError, format!("Machine changed to unexpected state: {state}"));
    }

    fn terminate(self: &Rc<Self>, reason: StreamEndReason, description: String) {
        if self.inner.borrow().phase == Phase::Ended {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.reader = None;
            inner.phase = Phase::Ended;
            inner.ended = true;
            inner.events.push(DriverEvent::StreamingEnded(reason, description));
        }
        self.link.borrow_mut().hard_reset(self.hard_reset_delay);
    }
}

impl CommandSenderListener for GCodeStreamer {
    fn command_sent(&self, _id: CommandId) {
        let phase = self.inner.borrow().phase;
        if phase != Phase::Running && phase != Phase::Priming {
            return;
        }
        // pump_more takes `self: &Rc<Self>`, so a strong handle has to be
        // recovered from the weak self-reference to call it from here.
        if let Some(strong) = self.self_handle() {
            strong.pump_more();
        }
    }

    fn ok_reply(&self, _id: CommandId) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.expected_acks = inner.expected_acks.saturating_sub(1);
        }
        if let Some(strong) = self.self_handle() {
            strong.maybe_finish();
        }
    }

    fn error_reply(&self, _id: CommandId, code: u32) {
        if let Some(strong) = self.self_handle() {
            strong.terminate(StreamEndReason::MachineError, format!("Firmware replied with error:{code}"));
        }
    }

    fn reply_lost(&self, _id: CommandId, _command_was_sent: bool) {
        if let Some(strong) = self.self_handle() {
            strong.terminate(StreamEndReason::PortError, "Failed to get replies for some commands".to_string());
        }
    }
}

impl GCodeStreamer {
    /// Recover a strong `Rc<Self>` from within a `&self` listener callback.
    /// Always succeeds while the streamer is alive: `self_weak` is seeded
    /// from the same allocation via `Rc::new_cyclic` at construction time.
    fn self_handle(&self) -> Option<Rc<Self>> {
        self.self_weak.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HARD_RESET;
    use crate::link::LinkEvent;
    use crate::port::PortHandle;
    use std::io::{self, Cursor};
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

    /// Records every byte written, shared via `Arc<Mutex<_>>` so the test
    /// can still read it once the port itself has been boxed away.
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

    type Harness = (Rc<RefCell<MachineLink>>, Rc<RefCell<CommandSender>>, Rc<RefCell<WireController>>);

    fn harness() -> Harness {
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(SinkPort));
        let link = Rc::new(RefCell::new(link));
        let sender = Rc::new(RefCell::new(CommandSender::new(link.clone())));
        let wire = Rc::new(RefCell::new(WireController::new(link.clone(), sender.clone())));
        (link, sender, wire)
    }

    fn recording_harness() -> (Arc<Mutex<Vec<u8>>>, Harness) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(RecordingPort { written: written.clone() }));
        let link = Rc::new(RefCell::new(link));
        let sender = Rc::new(RefCell::new(CommandSender::new(link.clone())));
        let wire = Rc::new(RefCell::new(WireController::new(link.clone(), sender.clone())));
        (written, (link, sender, wire))
    }

    fn program(lines: &str) -> io::Result<Box<dyn BufRead>> {
        Ok(Box::new(Cursor::new(lines.as_bytes().to_vec())))
    }

    fn ack(sender: &Rc<RefCell<CommandSender>>) {
        let notifications = sender.borrow_mut().handle_link_event(&LinkEvent::MessageReceived("ok".to_string()));
        dispatch_all(notifications);
    }

    #[test]
    fn completion_emits_wire_off_before_streaming_ended() {
        let (link, sender, wire) = harness();
        let streamer = GCodeStreamer::start(
            link,
            sender.clone(),
            wire,
            MachineState::Idle,
            program("G1 X1\n"),
            Duration::from_millis(1),
        );

        streamer.state_changed(MachineState::Run);
        streamer.state_changed(MachineState::Idle);
        ack(&sender);

        assert!(streamer.is_ended());
        let events = streamer.drain_events();
        let wire_off_pos = events.iter().position(|e| matches!(e, DriverEvent::WireOff)).unwrap();
        let ended_pos = events
            .iter()
            .position(|e| matches!(e, DriverEvent::StreamingEnded(StreamEndReason::Completed, _)))
            .unwrap();
        assert!(wire_off_pos < ended_pos, "wire must switch off before the run is reported complete");
    }

    #[test]
    fn premature_idle_is_deferred_until_run_has_been_observed() {
        let (link, sender, wire) = harness();
        let streamer = GCodeStreamer::start(
            link,
            sender.clone(),
            wire,
            MachineState::Idle,
            program("G1 X1\n"),
            Duration::from_millis(1),
        );

        // Ack the only submitted command so expected_acks reaches zero.
        ack(&sender);

        // Status noise reports Idle before the machine has ever reported
        // Run; the stream must not be declared complete yet.
        streamer.state_changed(MachineState::Idle);
        assert!(!streamer.is_ended(), "must not finish before at least one Run has been observed");

        streamer.state_changed(MachineState::Run);
        streamer.state_changed(MachineState::Idle);
        assert!(streamer.is_ended());
    }

    #[test]
    fn unexpected_state_during_run_triggers_hard_reset_and_terminates() {
        let (written, (link, sender, wire)) = recording_harness();
        let streamer = GCodeStreamer::start(
            link,
            sender,
            wire,
            MachineState::Idle,
            program("G1 X1\n"),
            Duration::from_millis(1),
        );
        written.lock().unwrap().clear();

        streamer.state_changed(MachineState::Alarm);

        assert!(streamer.is_ended());
        assert!(written.lock().unwrap().contains(&HARD_RESET));
        let events = streamer.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, DriverEvent::StreamingEnded(StreamEndReason::MachineError, _))));
    }

    #[test]
    fn reset_reentrancy_across_multiple_in_flight_commands_terminates_once() {
        let (written, (link, sender, wire)) = recording_harness();
        let streamer = GCodeStreamer::start(
            link,
            sender.clone(),
            wire,
            MachineState::Idle,
            program("G1 X1\nG1 X2\n"),
            Duration::from_millis(1),
        );
        assert!(!streamer.is_ended());
        written.lock().unwrap().clear();

        // Both lines are in flight with the streamer registered as listener
        // on each; losing the port notifies `reply_lost` once per command.
        let notifications = sender.borrow_mut().handle_link_event(&LinkEvent::PortClosed);
        dispatch_all(notifications);

        assert!(streamer.is_ended());
        // `terminate` is a no-op once the phase is `Ended`, so the second
        // `reply_lost` must not trigger a second hard reset.
        assert_eq!(written.lock().unwrap().iter().filter(|&&b| b == HARD_RESET).count(), 1);
    }
}
