//! Write-transfer engine: serving values to a remote requestor
//!
//! One write transfer pumps bytes from a caller-supplied producer into a
//! bounded buffer and flushes that buffer into the requestor's property in
//! bounded pieces. Small values that are complete before the first flush go
//! out in a single property write; everything else is announced as an
//! incremental transfer and streamed chunk by chunk, each write gated on
//! the requestor deleting the previous one, terminated by a zero-length
//! write. The state machine below is the heart of the protocol:
//!
//! ```text
//! Idle -> Accumulating -> Flushed(Direct|Incremental) -> AwaitingDeletion
//!             ^                                                |
//!             +------------------------------------------------+
//!                     (more data)            (drained + eof) -> Finished
//! ```

use log::{debug, info, trace, warn};

use crate::engine::{SelectionEngine, TimerTarget, WriteAdmission, WriteHandle};
use crate::error::SelectionError;
use crate::proto::{Atom, Timestamp, TimerHost, TimerToken, Transport, Window, CURRENT_TIME};
use crate::queue::QueuedRequest;

/// What a producer returned from one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Produced `n` bytes; more may be available immediately.
    Data(usize),
    /// Nothing available right now; the host will call `resume_write` when
    /// the producer becomes readable again.
    WouldBlock,
    /// Produced `n` bytes and needs the buffer flushed before it can
    /// continue (the next item does not fit).
    NeedSpace(usize),
    /// Produced the final `n` bytes; no more data will follow.
    Eof(usize),
}

/// How a write transfer ended, reported to its producer exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was delivered and acknowledged.
    Completed,
    /// The transfer was cut off (timeout, abort, or transport failure); the
    /// producer should free its resources.
    Abandoned,
}

/// Pull-based byte source feeding one write transfer.
///
/// The engine guarantees exactly one terminal [`close`](DataProducer::close)
/// call per producer, after which no further `pull` calls are made.
pub trait DataProducer {
    /// Fills up to `buf.len()` bytes and reports what happened.
    fn pull(&mut self, buf: &mut [u8]) -> Result<Pull, SelectionError>;

    /// Terminal call; always invoked exactly once.
    fn close(&mut self, outcome: TransferOutcome);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushMode {
    Direct,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    Idle,
    Accumulating,
    Flushed(FlushMode),
    AwaitingDeletion,
    Finished,
}

/// Whether a flush left the transfer waiting or completed it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Pending,
    Complete,
}

/// One in-flight delivery of a value to a remote requestor.
pub(crate) struct WriteTransfer {
    pub requestor: Window,
    pub selection: Atom,
    pub target: Atom,
    pub property: Atom,
    pub time: Timestamp,
    pub state: WriteState,
    data: Box<[u8]>,
    len: usize,
    pub eof: bool,
    pub incr: bool,
    /// First flush happened; for standalone transfers this also means the
    /// success notify went out.
    pub notified: bool,
    /// The producer became readable while a write was still unconsumed; the
    /// pull is deferred until the deletion is observed.
    pub pending_readable: bool,
    pub sent: u64,
    pub timer: TimerToken,
    /// Batch membership: (record id, pair index).
    pub multi: Option<(u64, usize)>,
    pub producer: Box<dyn DataProducer>,
}

impl WriteTransfer {
    fn spare_len(&self) -> usize {
        self.data.len() - self.len
    }

    fn buffered(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn pull_into_spare(&mut self) -> Result<Pull, SelectionError> {
        let len = self.len;
        self.producer.pull(&mut self.data[len..])
    }

    /// Accounts bytes the producer wrote into the spare region.
    fn absorb(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    /// Drops `n` flushed bytes off the front of the buffer.
    fn consume(&mut self, n: usize) {
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    /// Direct host entry for serving a value to `requestor`. Inbound
    /// requests from the event feed take the same admission path with a
    /// producer resolved from the owning selection's source.
    pub fn begin_write(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
        producer: Box<dyn DataProducer>,
    ) -> Result<WriteAdmission, SelectionError> {
        self.admit_request(QueuedRequest {
            requestor,
            selection,
            target,
            property,
            time,
            producer: Some(producer),
        })
    }

    /// The producer has bytes ready. Pumps immediately while accumulating;
    /// while a write awaits its deletion the read is deferred to preserve
    /// the strict write/delete alternation.
    pub fn resume_write(&mut self, handle: WriteHandle) -> Result<(), SelectionError> {
        let id = handle.0;
        {
            let Some(xfer) = self.writes.get_mut(&id) else {
                return Err(SelectionError::UnknownTransfer);
            };
            match xfer.state {
                WriteState::Idle | WriteState::Accumulating => {}
                WriteState::Finished => return Ok(()),
                _ => {
                    xfer.pending_readable = true;
                    return Ok(());
                }
            }
        }
        self.pump_write(id);
        Ok(())
    }

    /// Abandons an in-flight write; behaves exactly like a timeout.
    pub fn abort_write(&mut self, handle: WriteHandle) -> Result<(), SelectionError> {
        let id = handle.0;
        let Some(xfer) = self.writes.remove(&id) else {
            return Err(SelectionError::UnknownTransfer);
        };
        self.abort_write_inner(id, xfer, "cancelled by caller");
        Ok(())
    }

    /// Shared admission path: conflicting pairs defer, missing owners and
    /// unsupported targets refuse, everything else spawns a transfer.
    pub(crate) fn admit_request(
        &mut self,
        mut req: QueuedRequest,
    ) -> Result<WriteAdmission, SelectionError> {
        // A busy (requestor, property) pair defers, never refuses. Requests
        // already queued for the pair count as busy to preserve ordering.
        if self.write_conflicts(req.requestor, req.property) {
            if self.queue.len() >= self.config.max_queued_requests {
                warn!("📨 Deferred-request queue full ({})", self.queue.len());
                if let Some(mut producer) = req.producer.take() {
                    producer.close(TransferOutcome::Abandoned);
                }
                self.refuse_request(
                    req.requestor,
                    req.selection,
                    req.target,
                    req.time,
                    "queue full",
                );
                return Ok(WriteAdmission::Refused);
            }
            debug!(
                "📨 Deferring conversion request for busy pair ({:#x}, {})",
                req.requestor, req.property
            );
            self.stats.requests_deferred += 1;
            self.queue.push(req);
            return Ok(WriteAdmission::Deferred);
        }

        let producer = match req.producer.take() {
            Some(producer) => producer,
            None => {
                let Some(owner) = self.owners.get_mut(&req.selection) else {
                    self.refuse_request(
                        req.requestor,
                        req.selection,
                        req.target,
                        req.time,
                        "selection not owned",
                    );
                    return Ok(WriteAdmission::Refused);
                };
                if req.time != CURRENT_TIME && req.time < owner.time {
                    self.refuse_request(
                        req.requestor,
                        req.selection,
                        req.target,
                        req.time,
                        "stale request time",
                    );
                    return Ok(WriteAdmission::Refused);
                }
                if !owner.targets.contains(&req.target) {
                    self.refuse_request(
                        req.requestor,
                        req.selection,
                        req.target,
                        req.time,
                        "unsupported target",
                    );
                    return Ok(WriteAdmission::Refused);
                }
                match owner.source.start(req.target) {
                    Ok(producer) => producer,
                    Err(err) => {
                        warn!("📤 Source failed to start target {}: {}", req.target, err);
                        self.refuse_request(
                            req.requestor,
                            req.selection,
                            req.target,
                            req.time,
                            "source start failed",
                        );
                        return Ok(WriteAdmission::Refused);
                    }
                }
            }
        };

        match self.start_write(
            req.requestor,
            req.selection,
            req.target,
            req.property,
            req.time,
            producer,
            None,
        ) {
            Ok(handle) => Ok(WriteAdmission::Started(handle)),
            Err(err) => {
                warn!("📤 Could not start write transfer: {}", err);
                self.refuse_request(
                    req.requestor,
                    req.selection,
                    req.target,
                    req.time,
                    "transfer setup failed",
                );
                Ok(WriteAdmission::Refused)
            }
        }
    }

    pub(crate) fn write_conflicts(&self, requestor: Window, property: Atom) -> bool {
        self.writes_by_dest.contains_key(&(requestor, property))
            || self.queue.conflicts(requestor, property)
    }

    /// Spawns the transfer record and runs the first producer pump.
    pub(crate) fn start_write(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
        mut producer: Box<dyn DataProducer>,
        multi: Option<(u64, usize)>,
    ) -> Result<WriteHandle, SelectionError> {
        if let Err(err) = self.watch(requestor) {
            producer.close(TransferOutcome::Abandoned);
            return Err(err);
        }
        let id = self.next_id();
        let timer = self.arm_timer(TimerTarget::Write(id));
        let capacity = self.config.transfer_buffer_size.max(4);
        debug!(
            "📤 Write {} started: selection {} target {} -> window {:#x} property {}",
            id, selection, target, requestor, property
        );
        self.writes.insert(
            id,
            WriteTransfer {
                requestor,
                selection,
                target,
                property,
                time,
                state: WriteState::Idle,
                data: vec![0u8; capacity].into_boxed_slice(),
                len: 0,
                eof: false,
                incr: false,
                notified: false,
                pending_readable: false,
                sent: 0,
                timer,
                multi,
                producer,
            },
        );
        self.writes_by_dest.insert((requestor, property), id);
        self.stats.writes_started += 1;
        self.pump_write(id);
        Ok(WriteHandle(id))
    }

    /// Asks the producer for bytes until the buffer fills, production
    /// blocks, or the value ends. Only runs while no property write is
    /// outstanding.
    pub(crate) fn pump_write(&mut self, id: u64) {
        let Some(mut xfer) = self.writes.remove(&id) else {
            return;
        };
        debug_assert!(matches!(
            xfer.state,
            WriteState::Idle | WriteState::Accumulating
        ));
        xfer.state = WriteState::Accumulating;
        let mut progress = false;

        loop {
            if xfer.spare_len() == 0 {
                match self.flush_write(id, &mut xfer) {
                    Ok(FlushOutcome::Pending) => break,
                    Ok(FlushOutcome::Complete) => {
                        self.finish_write(id, xfer, true);
                        return;
                    }
                    Err(err) => {
                        self.abort_write_inner(id, xfer, &format!("flush failed: {}", err));
                        return;
                    }
                }
            }

            let pull = match xfer.pull_into_spare() {
                Ok(pull) => pull,
                Err(err) => {
                    self.abort_write_inner(id, xfer, &format!("producer failed: {}", err));
                    return;
                }
            };
            match pull {
                Pull::Data(0) | Pull::WouldBlock => break,
                Pull::Data(n) => {
                    xfer.absorb(n);
                    progress = true;
                }
                Pull::NeedSpace(n) => {
                    xfer.absorb(n);
                    if xfer.len == 0 {
                        self.abort_write_inner(id, xfer, "producer demanded flush of empty buffer");
                        return;
                    }
                    progress = true;
                    match self.flush_write(id, &mut xfer) {
                        Ok(FlushOutcome::Pending) => break,
                        Ok(FlushOutcome::Complete) => {
                            self.finish_write(id, xfer, true);
                            return;
                        }
                        Err(err) => {
                            self.abort_write_inner(id, xfer, &format!("flush failed: {}", err));
                            return;
                        }
                    }
                }
                Pull::Eof(n) => {
                    xfer.absorb(n);
                    xfer.eof = true;
                    progress = true;
                    match self.flush_write(id, &mut xfer) {
                        Ok(FlushOutcome::Pending) => break,
                        Ok(FlushOutcome::Complete) => {
                            self.finish_write(id, xfer, true);
                            return;
                        }
                        Err(err) => {
                            self.abort_write_inner(id, xfer, &format!("flush failed: {}", err));
                            return;
                        }
                    }
                }
            }
        }

        if progress {
            xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Write(id));
        }
        self.writes.insert(id, xfer);
    }

    /// Pushes buffered bytes onto the wire. The first flush decides the
    /// path: a complete small value goes out directly with its true type;
    /// anything else announces an incremental transfer. Later flushes write
    /// one bounded chunk each; an empty flush at end-of-data is the
    /// zero-length terminator and completes the transfer.
    fn flush_write(
        &mut self,
        id: u64,
        xfer: &mut WriteTransfer,
    ) -> Result<FlushOutcome, SelectionError> {
        if !xfer.notified {
            if xfer.eof && xfer.len <= self.quantum {
                xfer.state = WriteState::Flushed(FlushMode::Direct);
                self.transport
                    .write_property(xfer.requestor, xfer.property, xfer.target, xfer.buffered())?;
                xfer.sent += xfer.len as u64;
                self.stats.bytes_out += xfer.len as u64;
                debug!("📤 Write {}: direct value flushed ({} bytes)", id, xfer.len);
                xfer.len = 0;
            } else {
                xfer.incr = true;
                xfer.state = WriteState::Flushed(FlushMode::Incremental);
                // The announced size is the protocol's lower-bound estimate.
                self.transport.write_property_words(
                    xfer.requestor,
                    xfer.property,
                    self.atoms.incr,
                    &[xfer.len as u32],
                )?;
                debug!(
                    "📤 Write {}: incremental transfer announced (>= {} bytes)",
                    id, xfer.len
                );
            }
            if xfer.multi.is_none() {
                self.transport.send_notify(
                    xfer.requestor,
                    xfer.selection,
                    xfer.target,
                    Some(xfer.property),
                    xfer.time,
                )?;
            }
            self.transport.flush()?;
            xfer.notified = true;
            xfer.state = WriteState::AwaitingDeletion;
            return Ok(FlushOutcome::Pending);
        }

        debug_assert!(xfer.incr, "only incremental transfers flush repeatedly");
        if xfer.len == 0 && xfer.eof {
            // Zero-length terminator with the true type.
            self.transport
                .write_property(xfer.requestor, xfer.property, xfer.target, &[])?;
            self.transport.flush()?;
            debug!("📤 Write {}: terminator written", id);
            xfer.state = WriteState::Finished;
            return Ok(FlushOutcome::Complete);
        }

        let chunk = xfer.len.min(self.quantum);
        xfer.state = WriteState::Flushed(FlushMode::Incremental);
        self.transport.write_property(
            xfer.requestor,
            xfer.property,
            xfer.target,
            &xfer.buffered()[..chunk],
        )?;
        self.transport.flush()?;
        xfer.consume(chunk);
        xfer.sent += chunk as u64;
        self.stats.bytes_out += chunk as u64;
        trace!(
            "📤 Write {}: chunk flushed ({} bytes, {} still buffered)",
            id,
            chunk,
            xfer.len
        );
        xfer.state = WriteState::AwaitingDeletion;
        Ok(FlushOutcome::Pending)
    }

    /// The requestor deleted the property: the previous write has been
    /// consumed and the next step may proceed.
    pub(crate) fn handle_write_property_deleted(&mut self, window: Window, property: Atom) {
        let Some(&id) = self.writes_by_dest.get(&(window, property)) else {
            return;
        };
        let Some(mut xfer) = self.writes.remove(&id) else {
            return;
        };
        if xfer.state != WriteState::AwaitingDeletion {
            self.writes.insert(id, xfer);
            return;
        }

        if xfer.len == 0 && xfer.eof && !xfer.incr {
            // Direct value consumed; nothing further to write.
            self.finish_write(id, xfer, true);
            return;
        }

        if xfer.len == 0 && !xfer.eof {
            // Buffer drained mid-stream: go back to the producer.
            if xfer.pending_readable {
                debug!("📤 Write {}: resuming deferred producer read", id);
            }
            xfer.pending_readable = false;
            xfer.state = WriteState::Accumulating;
            xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Write(id));
            self.writes.insert(id, xfer);
            self.pump_write(id);
            return;
        }

        // Buffered data (or the terminator) goes out now.
        match self.flush_write(id, &mut xfer) {
            Ok(FlushOutcome::Pending) => {
                xfer.timer = self.rearm_timer(xfer.timer, TimerTarget::Write(id));
                self.writes.insert(id, xfer);
            }
            Ok(FlushOutcome::Complete) => self.finish_write(id, xfer, true),
            Err(err) => self.abort_write_inner(id, xfer, &format!("flush failed: {}", err)),
        }
    }

    pub(crate) fn write_timed_out(&mut self, id: u64) {
        let Some(xfer) = self.writes.remove(&id) else {
            return;
        };
        self.stats.timeouts += 1;
        self.abort_write_inner(id, xfer, "timeout");
    }

    pub(crate) fn abort_write_inner(&mut self, id: u64, xfer: WriteTransfer, why: &str) {
        warn!("🚫 Write {} aborted: {}", id, why);
        self.finish_write(id, xfer, false);
    }

    /// Single terminal path for every write transfer: deregisters event
    /// interest, cancels the timer, gives the producer its one terminal
    /// call, answers the requestor if no answer went out yet, settles the
    /// batch record, and replays any unblocked queued requests.
    pub(crate) fn finish_write(&mut self, id: u64, mut xfer: WriteTransfer, success: bool) {
        xfer.state = WriteState::Finished;
        self.writes_by_dest.remove(&(xfer.requestor, xfer.property));
        self.cancel_timer(xfer.timer);
        self.unwatch(xfer.requestor);
        xfer.producer.close(if success {
            TransferOutcome::Completed
        } else {
            TransferOutcome::Abandoned
        });
        if success {
            self.stats.writes_completed += 1;
            info!(
                "✅ Write {} complete: {} bytes to window {:#x}",
                id, xfer.sent, xfer.requestor
            );
        } else {
            self.stats.writes_failed += 1;
            if !xfer.notified && xfer.multi.is_none() {
                let sent = self
                    .transport
                    .send_notify(xfer.requestor, xfer.selection, xfer.target, None, xfer.time)
                    .and_then(|_| self.transport.flush());
                if let Err(err) = sent {
                    warn!("⚠️ Failed to deliver failure notify: {}", err);
                }
            }
        }
        if let Some((record, index)) = xfer.multi {
            self.multi_child_done(record, index, success);
        }
        self.maybe_replay_queue();
    }
}
