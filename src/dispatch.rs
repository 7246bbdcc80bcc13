//! Event dispatcher
//!
//! Routes the three relevant protocol event kinds to the read and write
//! engines and answers the two reflexive targets inline. Which table owns a
//! property name — the read slots on the transfer window or the
//! (requestor, property) destinations — disambiguates property-changed
//! events; echoes of the engine's own writes and deletes are dropped here.

use log::trace;

use x11rb::protocol::xproto::AtomEnum;

use crate::engine::{SelectionEngine, TimerTarget};
use crate::proto::{
    Atom, PropertyEdit, SelectionEvent, TimerHost, TimerToken, Timestamp, Transport, Window,
    CURRENT_TIME,
};
use crate::queue::QueuedRequest;

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    /// Feeds one protocol event into the engine. All state transitions
    /// happen synchronously inside this call.
    pub fn handle_event(&mut self, event: SelectionEvent) {
        match event {
            SelectionEvent::ConvertRequested {
                requestor,
                selection,
                target,
                property,
                time,
            } => {
                self.note_time(time);
                self.handle_convert_requested(requestor, selection, target, property, time);
            }
            SelectionEvent::ConversionDone {
                selection,
                target,
                property,
                time,
            } => {
                self.note_time(time);
                self.handle_conversion_done(selection, target, property);
            }
            SelectionEvent::PropertyChanged {
                window,
                property,
                edit,
                time,
            } => {
                self.note_time(time);
                let transfer_window = self.transport.transfer_window();
                match edit {
                    PropertyEdit::NewValue if window == transfer_window => {
                        self.handle_read_property(property)
                    }
                    PropertyEdit::Deleted if window != transfer_window => {
                        self.handle_write_property_deleted(window, property)
                    }
                    // Echoes of our own property writes and deletes.
                    _ => {}
                }
            }
        }
    }

    /// Host timer callback entry. Tokens for timers already cancelled (or
    /// already fired) are ignored.
    pub fn timer_fired(&mut self, token: TimerToken) {
        let Some(target) = self.timer_targets.remove(&token) else {
            return;
        };
        match target {
            TimerTarget::Read(id) => self.read_timed_out(id),
            TimerTarget::Write(id) => self.write_timed_out(id),
        }
    }

    fn handle_convert_requested(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        mut property: Atom,
        time: Timestamp,
    ) {
        trace!(
            "➡️ Convert request: selection {} target {} property {} from {:#x}",
            selection,
            target,
            property,
            requestor
        );

        let owner_time = match self.owners.get(&selection) {
            Some(owner) => owner.time,
            None => {
                self.refuse_request(requestor, selection, target, time, "selection not owned");
                return;
            }
        };
        if time != CURRENT_TIME && time < owner_time {
            self.refuse_request(requestor, selection, target, time, "stale request time");
            return;
        }

        if target == self.atoms.multiple {
            // A batch without a pair-array property is unanswerable.
            if property == 0 {
                self.refuse_request(requestor, selection, target, time, "batch without property");
                return;
            }
            self.handle_multiple(requestor, selection, property, time);
            return;
        }

        // Pre-ICCCM clients omit the property; convention is to use the
        // target atom in its place.
        if property == 0 {
            property = target;
        }

        if target == self.atoms.targets {
            let ok = self.reply_targets(requestor, selection, property);
            self.notify_reply(requestor, selection, target, property, time, ok);
            return;
        }
        if target == self.atoms.timestamp {
            let ok = self.reply_timestamp(requestor, selection, property);
            self.notify_reply(requestor, selection, target, property, time, ok);
            return;
        }

        let _ = self.admit_request(QueuedRequest {
            requestor,
            selection,
            target,
            property,
            time,
            producer: None,
        });
    }

    /// Writes the supported-targets list; reflexive, no producer involved.
    pub(crate) fn reply_targets(
        &mut self,
        requestor: Window,
        selection: Atom,
        property: Atom,
    ) -> bool {
        let words: Vec<u32> = match self.owners.get(&selection) {
            Some(owner) => {
                let mut words = owner.targets.clone();
                words.extend([self.atoms.targets, self.atoms.timestamp, self.atoms.multiple]);
                words
            }
            None => return false,
        };
        self.transport
            .write_property_words(requestor, property, AtomEnum::ATOM.into(), &words)
            .is_ok()
    }

    /// Writes the selection acquisition time; reflexive, no producer.
    pub(crate) fn reply_timestamp(
        &mut self,
        requestor: Window,
        selection: Atom,
        property: Atom,
    ) -> bool {
        let time = match self.owners.get(&selection) {
            Some(owner) => owner.time,
            None => return false,
        };
        self.transport
            .write_property_words(requestor, property, AtomEnum::INTEGER.into(), &[time])
            .is_ok()
    }

    fn notify_reply(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
        ok: bool,
    ) {
        if !ok {
            self.refuse_request(requestor, selection, target, time, "reflexive reply failed");
            return;
        }
        let sent = self
            .transport
            .send_notify(requestor, selection, target, Some(property), time)
            .and_then(|_| self.transport.flush());
        if let Err(err) = sent {
            log::warn!("⚠️ Failed to deliver conversion notify: {}", err);
        }
    }
}
