//! Windowed G-code command streaming.
//!
//! Respects the firmware's bounded receive buffer by tracking an in-flight
//! window (`sent_bytes <= GRBL_BUFFER_SIZE`) and a pending queue that only
//! drains as `ok`/`error` replies arrive.

use crate::link::{LinkEvent, MachineLink};
use hotwire_core::command::{Command, CommandId, GRBL_BUFFER_SIZE};
use hotwire_core::error::ProtocolError;
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::LazyLock;

static OK_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ok$").unwrap());
static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^error:(\d+)$").unwrap());

/// Receives per-command lifecycle notifications from [`CommandSender`].
///
/// Registered as a [`Weak`] reference: a listener whose strong references
/// have all been dropped is simply skipped on dispatch rather than erroring,
/// standing in for the destruction hook the original design relied on.
pub trait CommandSenderListener {
    fn command_sent(&self, id: CommandId);
    fn ok_reply(&self, id: CommandId);
    fn error_reply(&self, id: CommandId, code: u32);
    fn reply_lost(&self, id: CommandId, command_was_sent: bool);
}

struct QueuedCommand {
    id: CommandId,
    listener: Option<Weak<dyn CommandSenderListener>>,
    command: Command,
}

/// A listener callback deferred until after the `RefCell` borrow that
/// produced it has been released. `CommandSender`'s own methods never call a
/// listener directly: a listener callback (e.g. `command_sent` triggering a
/// streamer to submit more lines) routinely calls back into the same
/// `CommandSender`, and invoking it while still inside a `borrow_mut()` would
/// panic. Callers collect these and dispatch them once the borrow is gone.
pub(crate) enum Notification {
    CommandSent(Weak<dyn CommandSenderListener>, CommandId),
    OkReply(Weak<dyn CommandSenderListener>, CommandId),
    ErrorReply(Weak<dyn CommandSenderListener>, CommandId, u32),
    ReplyLost(Weak<dyn CommandSenderListener>, CommandId, bool),
}

impl Notification {
    pub(crate) fn dispatch(self) {
        match self {
            Notification::CommandSent(listener, id) => {
                if let Some(listener) = listener.upgrade() {
                    listener.command_sent(id);
                }
            }
            Notification::OkReply(listener, id) => {
                if let Some(listener) = listener.upgrade() {
                    listener.ok_reply(id);
                }
            }
            Notification::ErrorReply(listener, id, code) => {
                if let Some(listener) = listener.upgrade() {
                    listener.error_reply(id, code);
                }
            }
            Notification::ReplyLost(listener, id, command_was_sent) => {
                if let Some(listener) = listener.upgrade() {
                    listener.reply_lost(id, command_was_sent);
                }
            }
        }
    }
}

pub(crate) fn dispatch_all(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.dispatch();
    }
}

/// Windowed sender for G-code commands.
pub struct CommandSender {
    link: Rc<RefCell<MachineLink>>,
    in_flight: VecDeque<QueuedCommand>,
    pending: VecDeque<QueuedCommand>,
    sent_bytes: usize,
    next_id: CommandId,
    resetting: Cell<bool>,
}

impl CommandSender {
    pub fn new(link: Rc<RefCell<MachineLink>>) -> Self {
        Self {
            link,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            sent_bytes: 0,
            next_id: 1,
            resetting: Cell::new(false),
        }
    }

    /// Number of commands accepted but not yet written to the port.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn sent_bytes(&self) -> usize {
        self.sent_bytes
    }

    /// Validate, assign an id, and either write immediately or enqueue.
    /// Returns the id alongside any listener notifications the caller must
    /// dispatch once it has released its borrow of this sender.
    pub fn send_command(
        &mut self,
        bytes: impl AsRef<[u8]>,
        listener: Option<Weak<dyn CommandSenderListener>>,
    ) -> Result<(CommandId, Vec<Notification>), ProtocolError> {
        let command = Command::new(bytes.as_ref().to_vec())?;
        let id = self.next_id;
        self.next_id += 1;
        let queued = QueuedCommand { id, listener, command };

        let mut notifications = Vec::new();
        if self.pending.is_empty() && self.sent_bytes + queued.command.len() <= GRBL_BUFFER_SIZE {
            self.write_and_track(queued, &mut notifications);
        } else {
            self.pending.push_back(queued);
        }
        Ok((id, notifications))
    }

    fn write_and_track(&mut self, queued: QueuedCommand, notifications: &mut Vec<Notification>) {
        self.sent_bytes += queued.command.len();
        self.link.borrow_mut().write_data(queued.command.as_bytes());
        if let Some(listener) = queued.listener.clone() {
            notifications.push(Notification::CommandSent(listener, queued.id));
        }
        self.in_flight.push_back(queued);
    }

    fn drain_pending(&mut self, notifications: &mut Vec<Notification>) {
        while let Some(front) = self.pending.front() {
            if self.sent_bytes + front.command.len() > GRBL_BUFFER_SIZE {
                break;
            }
            let queued = self.pending.pop_front().unwrap();
            self.write_and_track(queued, notifications);
        }
    }

    /// React to a link event. Only `MessageReceived` and the lifecycle events
    /// (`PortClosed`/`PortClosedWithError`/`MachineInitialized`) are relevant;
    /// anything else is ignored. Returns listener notifications the caller
    /// must dispatch once it has released its borrow of this sender.
    pub fn handle_link_event(&mut self, event: &LinkEvent) -> Vec<Notification> {
        let mut notifications = Vec::new();
        match event {
            LinkEvent::MessageReceived(message) => self.handle_message(message, &mut notifications),
            LinkEvent::PortClosed | LinkEvent::PortClosedWithError(_) | LinkEvent::MachineInitialized => {
                self.reset(&mut notifications);
            }
            _ => {}
        }
        notifications
    }

    fn handle_message(&mut self, message: &str, notifications: &mut Vec<Notification>) {
        if OK_PATTERN.is_match(message) {
            self.dequeue_ok(notifications);
        } else if let Some(captures) = ERROR_PATTERN.captures(message) {
            let code: u32 = captures[1].parse().unwrap_or(0);
            self.dequeue_error(code, notifications);
        }
    }

    fn dequeue_ok(&mut self, notifications: &mut Vec<Notification>) {
        let Some(queued) = self.in_flight.pop_front() else {
            tracing::warn!("unexpected ok reply with no in-flight command");
            return;
        };
        self.sent_bytes -= queued.command.len();
        if let Some(listener) = queued.listener.clone() {
            notifications.push(Notification::OkReply(listener, queued.id));
        }
        self.drain_pending(notifications);
    }

    fn dequeue_error(&mut self, code: u32, notifications: &mut Vec<Notification>) {
        let Some(queued) = self.in_flight.pop_front() else {
            tracing::warn!("unexpected error reply with no in-flight command");
            return;
        };
        self.sent_bytes -= queued.command.len();
        if let Some(listener) = queued.listener.clone() {
            notifications.push(Notification::ErrorReply(listener, queued.id, code));
        }
        self.drain_pending(notifications);
    }

    /// Clear both queues, notifying every listener that its reply was lost.
    /// Guarded against re-entrant calls (a `reply_lost` callback that itself
    /// triggers a reset).
    fn reset(&mut self, notifications: &mut Vec<Notification>) {
        if self.resetting.get() {
            return;
        }
        self.resetting.set(true);

        for queued in self.in_flight.drain(..) {
            if let Some(listener) = queued.listener.clone() {
                notifications.push(Notification::ReplyLost(listener, queued.id, true));
            }
        }
        for queued in self.pending.drain(..) {
            if let Some(listener) = queued.listener.clone() {
                notifications.push(Notification::ReplyLost(listener, queued.id, false));
            }
        }
        self.sent_bytes = 0;

        self.resetting.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortHandle;
    use std::cell::RefCell as StdRefCell;
    use std::io;

    struct SinkPort;
    impl PortHandle for SinkPort {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn linked_sender() -> (Rc<RefCell<MachineLink>>, CommandSender) {
        let mut link = MachineLink::new(0);
        link.adopt(Box::new(SinkPort));
        let link = Rc::new(RefCell::new(link));
        let sender = CommandSender::new(link.clone());
        (link, sender)
    }

    #[derive(Default)]
    struct RecordingListener {
        replies_lost: StdRefCell<Vec<(CommandId, bool)>>,
    }

    impl CommandSenderListener for RecordingListener {
        fn command_sent(&self, _id: CommandId) {}
        fn ok_reply(&self, _id: CommandId) {}
        fn error_reply(&self, _id: CommandId, _code: u32) {}
        fn reply_lost(&self, id: CommandId, command_was_sent: bool) {
            self.replies_lost.borrow_mut().push((id, command_was_sent));
        }
    }

    #[test]
    fn windowed_streaming_defers_once_buffer_is_full() {
        let (_link, mut sender) = linked_sender();
        for _ in 0..16 {
            sender.send_command(b"0123456".to_vec(), None).unwrap();
        }
        assert_eq!(sender.sent_bytes(), 128);
        assert_eq!(sender.pending_commands(), 0);

        sender.send_command(b"more".to_vec(), None).unwrap();
        assert_eq!(sender.pending_commands(), 1);

        sender.handle_link_event(&LinkEvent::MessageReceived("ok".to_string()));
        assert_eq!(sender.pending_commands(), 0);
        assert_eq!(sender.sent_bytes(), 128 - 8 + 5);
    }

    #[test]
    fn oversized_command_is_rejected() {
        let (_link, mut sender) = linked_sender();
        let result = sender.send_command(vec![b'X'; GRBL_BUFFER_SIZE], None);
        assert!(result.is_err());
    }

    #[test]
    fn reset_notifies_in_flight_and_pending_listeners() {
        let (_link, mut sender) = linked_sender();
        let listener = Rc::new(RecordingListener::default());
        let weak: Weak<dyn CommandSenderListener> = {
            let concrete: Rc<dyn CommandSenderListener> = listener.clone();
            Rc::downgrade(&concrete)
        };

        for _ in 0..16 {
            sender.send_command(b"0123456".to_vec(), Some(weak.clone())).unwrap();
        }
        sender.send_command(b"more".to_vec(), Some(weak.clone())).unwrap();

        dispatch_all(sender.handle_link_event(&LinkEvent::PortClosed));

        let replies_lost = listener.replies_lost.borrow();
        assert_eq!(replies_lost.len(), 17);
        assert!(replies_lost.iter().take(16).all(|(_, sent)| *sent));
        assert!(!replies_lost.last().unwrap().1);

        assert_eq!(sender.pending_commands(), 0);
        assert_eq!(sender.sent_bytes(), 0);
    }
}
