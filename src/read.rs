//! Read-transfer engine: fetching values from a remote selection owner
//!
//! One read transfer drives a single "convert selection" request through
//! its protocol stages: the conversion request tagged with a pool slot, the
//! owner's notify, a zero-length length/type probe, then either bulk
//! retrieval or the incremental dance where the owner streams the value as
//! a sequence of property writes terminated by a zero-length write. The
//! caller consumes bytes at its own pace with
//! [`read_chunk`](crate::SelectionEngine::read_chunk); deleting the
//! consumed value is what asks the owner for more.

use log::{debug, trace, warn};

use crate::engine::{ReadHandle, SelectionEngine, TimerTarget};
use crate::error::SelectionError;
use crate::proto::{Atom, Timestamp, TimerHost, TimerToken, Transport};
use crate::slots::Slot;

/// Delivery callbacks for one read transfer.
///
/// Exactly one of the three terminal outcomes is reported through
/// [`on_finish`](ReadSink::on_finish), after the transfer's slot and timer
/// have already been released, so the sink may immediately start another
/// transfer from inside the callback.
pub trait ReadSink {
    /// The owner agreed to convert; `ty` is the concrete value type.
    fn on_start(&mut self, ty: Atom);

    /// `pending` bytes are ready to be pulled with `read_chunk`.
    fn on_chunk(&mut self, pending: usize);

    /// Terminal call. Returning [`FinishDisposition::Defer`] keeps the
    /// transfer record alive (unreachable by new events) until
    /// `release_read`.
    fn on_finish(&mut self, success: bool) -> FinishDisposition;
}

/// What to do with the transfer record after its terminal callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishDisposition {
    Free,
    Defer,
}

/// Bytes returned by one bounded chunk read.
#[derive(Debug)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    /// Bytes still stored in the property. Zero means the chunk (and, for
    /// bulk transfers, the whole value) has been fully consumed.
    pub remaining: usize,
}

/// One in-flight request for a value from a remote owner.
pub(crate) struct ReadTransfer {
    pub selection: Atom,
    pub target: Atom,
    pub slot: Slot,
    pub sink: Box<dyn ReadSink>,
    /// Value type pinned by the first successful probe; a change mid-value
    /// is a protocol violation.
    pub value_type: Atom,
    pub incr: bool,
    /// Set while an incremental transfer waits for the owner's next write.
    pub awaiting_chunk: bool,
    pub started: bool,
    pub notified: bool,
    pub cursor: usize,
    pub delivered: u64,
    pub timer: TimerToken,
}

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    /// Requests conversion of `selection` into `target` and begins a read
    /// transfer. With `time: None` the engine's current protocol time is
    /// used. Callbacks resume through the event feed; the returned handle
    /// is only needed for `read_chunk` and cancellation.
    pub fn begin_read(
        &mut self,
        selection: Atom,
        target: Atom,
        time: Option<Timestamp>,
        sink: Box<dyn ReadSink>,
    ) -> Result<ReadHandle, SelectionError> {
        let slot = self
            .slots
            .acquire(|index| self.transport.intern_slot_property(index))?;
        let window = self.transport.transfer_window();
        let time = time.unwrap_or(self.last_time);

        // Clear any stale value before the owner writes the fresh one.
        let issued = self
            .transport
            .delete_property(window, slot.atom)
            .and_then(|_| {
                self.transport
                    .convert_selection(selection, target, slot.atom, time)
            })
            .and_then(|_| self.transport.flush());
        if let Err(err) = issued {
            self.slots.release(slot);
            return Err(err);
        }

        let id = self.next_id();
        let timer = self.arm_timer(TimerTarget::Read(id));
        debug!(
            "📥 Read {} started: selection {} target {} via slot {}",
            id,
            selection,
            target,
            slot.index()
        );
        self.reads.insert(
            id,
            ReadTransfer {
                selection,
                target,
                slot,
                sink,
                value_type: 0,
                incr: false,
                awaiting_chunk: false,
                started: false,
                notified: false,
                cursor: 0,
                delivered: 0,
                timer,
            },
        );
        self.reads_by_slot.insert(slot.atom, id);
        self.stats.reads_started += 1;
        Ok(ReadHandle(id))
    }

    /// Pulls up to `max_len` bytes (bounded by the transfer quantum) from
    /// the current property value, deleting the consumed portion. A probe
    /// failure or a mid-value type change cancels the transfer before the
    /// error is returned. When this call consumes the final bytes of a bulk
    /// value the terminal callback fires before the call returns.
    pub fn read_chunk(
        &mut self,
        handle: ReadHandle,
        max_len: usize,
    ) -> Result<ReadChunk, SelectionError> {
        let id = handle.0;
        let Some(mut xfer) = self.reads.remove(&id) else {
            return Err(SelectionError::UnknownTransfer);
        };
        if !xfer.notified || xfer.awaiting_chunk {
            self.reads.insert(id, xfer);
            return Err(SelectionError::NotReadable);
        }

        let window = self.transport.transfer_window();
        let len = max_len.clamp(1, self.quantum);
        let chunk = match self
            .transport
            .read_property(window, xfer.slot.atom, xfer.cursor, len, true)
        {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("📥 Read {}: property read failed: {}", id, err);
                self.finish_read(id, xfer, false, "read failed");
                return Err(err);
            }
        };
        if chunk.ty != xfer.value_type {
            warn!(
                "📥 Read {}: value type changed mid-transfer ({} -> {})",
                id, xfer.value_type, chunk.ty
            );
            self.finish_read(id, xfer, false, "type changed");
            return Err(SelectionError::Malformed(
                "property type changed mid-transfer".into(),
            ));
        }

        xfer.cursor += chunk.data.len();
        xfer.delivered += chunk.data.len() as u64;
        self.stats.bytes_in += chunk.data.len() as u64;
        let remaining = chunk.remaining;
        trace!(
            "📥 Read {}: {} bytes pulled, {} outstanding",
            id,
            chunk.data.len(),
            remaining
        );

        if remaining == 0 {
            if xfer.incr {
                // Chunk drained and deleted; the owner may write the next
                // one whenever it likes.
                xfer.awaiting_chunk = true;
                xfer.cursor = 0;
                xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Read(id));
                self.reads.insert(id, xfer);
            } else {
                self.finish_read(id, xfer, true, "complete");
            }
        } else {
            xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Read(id));
            self.reads.insert(id, xfer);
        }

        Ok(ReadChunk {
            data: chunk.data,
            remaining,
        })
    }

    /// Force-finishes an in-flight read; behaves exactly like a timeout.
    pub fn cancel_read(&mut self, handle: ReadHandle) -> Result<(), SelectionError> {
        let id = handle.0;
        if let Some(xfer) = self.reads.remove(&id) {
            let window = self.transport.transfer_window();
            if let Err(err) = self.transport.delete_property(window, xfer.slot.atom) {
                debug!("📥 Read {}: stale property cleanup failed: {}", id, err);
            }
            self.finish_read(id, xfer, false, "cancelled");
            return Ok(());
        }
        if self.deferred_reads.remove(&id).is_some() {
            return Ok(());
        }
        Err(SelectionError::UnknownTransfer)
    }

    /// Finalizes a read whose sink deferred destruction from `on_finish`.
    pub fn release_read(&mut self, handle: ReadHandle) -> Result<(), SelectionError> {
        self.deferred_reads
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(SelectionError::UnknownTransfer)
    }

    /// Routes a conversion notify to the transfer that issued the request.
    pub(crate) fn handle_conversion_done(
        &mut self,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) {
        let id = if property != 0 {
            self.reads_by_slot.get(&property).copied()
        } else {
            // Refusals carry no property; match the oldest transfer still
            // waiting on this (selection, target).
            self.reads
                .iter()
                .filter(|(_, x)| x.selection == selection && x.target == target && !x.notified)
                .map(|(id, _)| *id)
                .min()
        };
        let Some(id) = id else {
            trace!(
                "📥 Ignoring stray conversion notify for selection {} target {}",
                selection,
                target
            );
            return;
        };
        let Some(mut xfer) = self.reads.remove(&id) else {
            return;
        };
        xfer.notified = true;
        if property == 0 {
            debug!("📥 Read {}: owner refused the conversion", id);
            self.finish_read(id, xfer, false, "refused");
            return;
        }
        self.probe_slot(id, xfer);
    }

    /// Incremental continuation: the owner wrote a new value into the slot
    /// property.
    pub(crate) fn handle_read_property(&mut self, property: Atom) {
        let Some(&id) = self.reads_by_slot.get(&property) else {
            return;
        };
        let Some(xfer) = self.reads.remove(&id) else {
            return;
        };
        if !xfer.incr || !xfer.awaiting_chunk {
            // Still draining the previous value, or the owner's first write
            // raced ahead of its notify; the probe path handles both later.
            self.reads.insert(id, xfer);
            return;
        }
        self.probe_slot(id, xfer);
    }

    /// Zero-length length/type query of the slot property, shared by the
    /// first notify and every incremental continuation.
    fn probe_slot(&mut self, id: u64, mut xfer: ReadTransfer) {
        let window = self.transport.transfer_window();
        let probe = match self.transport.probe_property(window, xfer.slot.atom) {
            Ok(probe) => probe,
            Err(err) => {
                warn!("📥 Read {}: length probe failed: {}", id, err);
                self.finish_read(id, xfer, false, "probe failed");
                return;
            }
        };

        if probe.ty == self.atoms.incr && !xfer.incr {
            // Deleting the marker arms the owner to start streaming.
            let armed = self
                .transport
                .delete_property(window, xfer.slot.atom)
                .and_then(|_| self.transport.flush());
            if let Err(err) = armed {
                warn!("📥 Read {}: could not arm incremental mode: {}", id, err);
                self.finish_read(id, xfer, false, "arm failed");
                return;
            }
            xfer.incr = true;
            xfer.awaiting_chunk = true;
            debug!("📥 Read {}: incremental transfer announced", id);
            xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Read(id));
            self.reads.insert(id, xfer);
            return;
        }

        if probe.bytes_total == 0 {
            // An empty value is a valid, complete value; incrementally it is
            // the zero-length terminator.
            if let Err(err) = self.transport.delete_property(window, xfer.slot.atom) {
                debug!("📥 Read {}: empty-value cleanup failed: {}", id, err);
            }
            let _ = self.transport.flush();
            self.finish_read(id, xfer, true, "complete");
            return;
        }

        xfer.value_type = probe.ty;
        xfer.cursor = 0;
        xfer.awaiting_chunk = false;
        if !xfer.started {
            xfer.started = true;
            xfer.sink.on_start(probe.ty);
        }
        xfer.sink.on_chunk(probe.bytes_total);
        xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Read(id));
        self.reads.insert(id, xfer);
    }

    pub(crate) fn read_timed_out(&mut self, id: u64) {
        let Some(xfer) = self.reads.remove(&id) else {
            return;
        };
        warn!("⏰ Read {} timed out waiting for the owner", id);
        let window = self.transport.transfer_window();
        if let Err(err) = self.transport.delete_property(window, xfer.slot.atom) {
            debug!("📥 Read {}: stale property cleanup failed: {}", id, err);
        }
        let _ = self.transport.flush();
        self.stats.timeouts += 1;
        self.finish_read(id, xfer, false, "timeout");
    }

    /// Single terminal path for every read transfer. The slot goes back to
    /// the pool and the timer is cancelled before the sink runs.
    pub(crate) fn finish_read(&mut self, id: u64, mut xfer: ReadTransfer, success: bool, why: &str) {
        self.reads_by_slot.remove(&xfer.slot.atom);
        self.cancel_timer(xfer.timer);
        self.slots.release(xfer.slot);
        if success {
            self.stats.reads_completed += 1;
        } else {
            self.stats.reads_failed += 1;
        }
        debug!(
            "📥 Read {} finished: {} ({} bytes, {})",
            id,
            if success { "ok" } else { "failed" },
            xfer.delivered,
            why
        );
        match xfer.sink.on_finish(success) {
            FinishDisposition::Free => {}
            FinishDisposition::Defer => {
                self.deferred_reads.insert(id, xfer);
            }
        }
    }
}
