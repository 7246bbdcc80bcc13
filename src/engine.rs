//! Owning state for X selection transfers
//!
//! One [`SelectionEngine`] holds every piece of process-wide selection
//! state: the slot pool, the read- and write-transfer tables with their
//! lookup indices, the deferred-request queue, batch records, and the
//! per-selection ownership table. It is constructed once and driven
//! synchronously by the host's event loop through
//! [`handle_event`](SelectionEngine::handle_event) and
//! [`timer_fired`](SelectionEngine::timer_fired); there are no globals and
//! no internal threads.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::config::SelectionConfig;
use crate::error::SelectionError;
use crate::multi::MultiRecord;
use crate::proto::{
    Atom, SelectionAtoms, Timestamp, TimerHost, TimerToken, Transport, Window, CURRENT_TIME,
};
use crate::queue::RequestQueue;
use crate::read::ReadTransfer;
use crate::slots::SlotPool;
use crate::write::{DataProducer, WriteTransfer};

/// Starts byte producers for a selection this engine owns.
///
/// One source is registered per owned selection via
/// [`SelectionEngine::own`]; the engine calls it once per accepted
/// conversion request. Each returned producer feeds exactly one write
/// transfer and receives exactly one terminal
/// [`close`](DataProducer::close) call.
pub trait SelectionSource {
    fn start(&mut self, target: Atom) -> Result<Box<dyn DataProducer>, SelectionError>;
}

/// Ownership record for one selection.
pub(crate) struct OwnerInfo {
    pub time: Timestamp,
    pub targets: Vec<Atom>,
    pub source: Box<dyn SelectionSource>,
}

/// Opaque handle to an in-flight (or deferred-finished) read transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadHandle(pub(crate) u64);

/// Opaque handle to an in-flight write transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub(crate) u64);

/// Outcome of admitting a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAdmission {
    /// A transfer was spawned.
    Started(WriteHandle),
    /// The (requestor, property) pair is busy; the request was queued and
    /// will be replayed when the pair frees up.
    Deferred,
    /// The request was answered with a protocol refusal.
    Refused,
}

/// What an armed timer belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerTarget {
    Read(u64),
    Write(u64),
}

/// Counters for observability.
#[derive(Debug, Clone, Default)]
pub struct SelectionStats {
    pub reads_started: u64,
    pub reads_completed: u64,
    pub reads_failed: u64,
    pub writes_started: u64,
    pub writes_completed: u64,
    pub writes_failed: u64,
    pub timeouts: u64,
    pub requests_deferred: u64,
    pub requests_refused: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// The selection transfer engine.
///
/// Generic over the wire [`Transport`] and the host [`TimerHost`] so the
/// protocol machinery is testable without an X server.
pub struct SelectionEngine<T: Transport, H: TimerHost> {
    pub(crate) transport: T,
    pub(crate) timers: H,
    pub(crate) atoms: SelectionAtoms,
    pub(crate) config: SelectionConfig,
    /// Largest single property read/write; queried from the transport once.
    pub(crate) quantum: usize,

    pub(crate) slots: SlotPool,
    pub(crate) reads: HashMap<u64, ReadTransfer>,
    pub(crate) reads_by_slot: HashMap<Atom, u64>,
    pub(crate) deferred_reads: HashMap<u64, ReadTransfer>,
    pub(crate) writes: HashMap<u64, WriteTransfer>,
    pub(crate) writes_by_dest: HashMap<(Window, Atom), u64>,
    pub(crate) queue: RequestQueue,
    pub(crate) multis: HashMap<u64, MultiRecord>,
    pub(crate) owners: HashMap<Atom, OwnerInfo>,

    /// Property-change interest per requestor window, reference counted so
    /// overlapping transfers never drop each other's event delivery.
    pub(crate) watches: HashMap<Window, usize>,
    pub(crate) timer_targets: HashMap<TimerToken, TimerTarget>,

    pub(crate) next_id: u64,
    pub(crate) next_timer: u64,
    pub(crate) last_time: Timestamp,
    pub(crate) stats: SelectionStats,
}

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    pub fn new(transport: T, timers: H, atoms: SelectionAtoms, config: SelectionConfig) -> Self {
        let quantum = transport.max_transfer_bytes();
        info!(
            "📋 Selection engine ready (transfer quantum {} bytes, timeout {} ms)",
            quantum, config.transfer_timeout_ms
        );
        Self {
            transport,
            timers,
            atoms,
            config,
            quantum,
            slots: SlotPool::new(),
            reads: HashMap::new(),
            reads_by_slot: HashMap::new(),
            deferred_reads: HashMap::new(),
            writes: HashMap::new(),
            writes_by_dest: HashMap::new(),
            queue: RequestQueue::default(),
            multis: HashMap::new(),
            owners: HashMap::new(),
            watches: HashMap::new(),
            timer_targets: HashMap::new(),
            next_id: 0,
            next_timer: 0,
            last_time: CURRENT_TIME,
            stats: SelectionStats::default(),
        }
    }

    /// Takes X ownership of `selection` on behalf of the compositor and
    /// registers the source that will answer conversion requests.
    pub fn own(
        &mut self,
        selection: Atom,
        time: Timestamp,
        targets: Vec<Atom>,
        source: Box<dyn SelectionSource>,
    ) -> Result<(), SelectionError> {
        let window = self.transport.transfer_window();
        self.transport
            .set_selection_owner(selection, Some(window), time)?;
        self.transport.flush()?;
        info!(
            "📋 Acquired selection {} at time {} ({} targets)",
            selection,
            time,
            targets.len()
        );
        self.owners.insert(
            selection,
            OwnerInfo {
                time,
                targets,
                source,
            },
        );
        Ok(())
    }

    /// Drops X ownership of `selection`. In-flight transfers keep the
    /// producers they already hold and drain normally; new requests are
    /// refused.
    pub fn disown(&mut self, selection: Atom) -> Result<(), SelectionError> {
        if self.owners.remove(&selection).is_some() {
            self.transport
                .set_selection_owner(selection, None, self.last_time)?;
            self.transport.flush()?;
            info!("📋 Released selection {}", selection);
        }
        Ok(())
    }

    /// Most recent protocol timestamp observed in any event.
    pub fn current_time(&self) -> Timestamp {
        self.last_time
    }

    pub fn stats(&self) -> &SelectionStats {
        &self.stats
    }

    pub fn active_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn active_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Slot names minted over the engine's lifetime; recycling keeps this
    /// bounded by the peak number of concurrent reads.
    pub fn slots_minted(&self) -> u64 {
        self.slots.minted()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.free_count()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timers(&self) -> &H {
        &self.timers
    }

    // Internal plumbing shared by the read and write halves.

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn note_time(&mut self, time: Timestamp) {
        if time != CURRENT_TIME {
            self.last_time = time;
        }
    }

    pub(crate) fn arm_timer(&mut self, target: TimerTarget) -> TimerToken {
        self.next_timer += 1;
        let token = TimerToken(self.next_timer);
        self.timer_targets.insert(token, target);
        self.timers
            .add_timer(self.config.transfer_timeout_ms, token);
        token
    }

    /// Cancels a timer if it is still armed. Tokens already consumed by
    /// `timer_fired` are silently skipped.
    pub(crate) fn cancel_timer(&mut self, token: TimerToken) {
        if self.timer_targets.remove(&token).is_some() {
            self.timers.remove_timer(token);
        }
    }

    /// Pushes a transfer's quiescence deadline out after forward progress.
    pub(crate) fn rearm_timer(&mut self, old: TimerToken, target: TimerTarget) -> TimerToken {
        self.cancel_timer(old);
        self.arm_timer(target)
    }

    pub(crate) fn watch(&mut self, window: Window) -> Result<(), SelectionError> {
        let count = self.watches.entry(window).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.transport.watch_window(window, true)?;
            debug!("👁️ Watching property changes on window {:#x}", window);
        }
        Ok(())
    }

    pub(crate) fn unwatch(&mut self, window: Window) {
        match self.watches.get_mut(&window) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.watches.remove(&window);
                if let Err(err) = self.transport.watch_window(window, false) {
                    // The requestor may already be gone; nothing to unwind.
                    debug!("👁️ Could not drop watch on {:#x}: {}", window, err);
                }
            }
            None => warn!("👁️ Unbalanced unwatch for window {:#x}", window),
        }
    }

    /// Answers a conversion request with a protocol refusal.
    pub(crate) fn refuse_request(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        time: Timestamp,
        why: &str,
    ) {
        warn!(
            "🚫 Refusing conversion of selection {} (target {}) for {:#x}: {}",
            selection, target, requestor, why
        );
        self.stats.requests_refused += 1;
        let sent = self
            .transport
            .send_notify(requestor, selection, target, None, time)
            .and_then(|_| self.transport.flush());
        if let Err(err) = sent {
            warn!("⚠️ Failed to deliver refusal notify: {}", err);
        }
    }
}
