//! Request serializer for conflicting inbound conversions
//!
//! A request whose (requestor, property) pair is occupied by an unfinished
//! write transfer, or by an earlier queued request, is held here verbatim.
//! When the active-transfer count returns to zero the whole queue is
//! detached and replayed oldest first; replays go through the normal
//! admission path, so a replay can re-queue behind a transfer spawned by an
//! earlier one.

use std::collections::VecDeque;

use log::info;

use crate::engine::SelectionEngine;
use crate::proto::{Atom, TimerHost, Timestamp, Transport, Window};
use crate::write::DataProducer;

/// A deferred inbound request, held until replay.
pub(crate) struct QueuedRequest {
    pub requestor: Window,
    pub selection: Atom,
    pub target: Atom,
    pub property: Atom,
    pub time: Timestamp,
    /// Present when a host-driven `begin_write` was deferred; the producer
    /// it supplied is carried along and used at replay.
    pub producer: Option<Box<dyn DataProducer>>,
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    pending: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, req: QueuedRequest) {
        self.pending.push_back(req);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn conflicts(&self, requestor: Window, property: Atom) -> bool {
        self.pending
            .iter()
            .any(|req| req.requestor == requestor && req.property == property)
    }

    /// Atomically detaches the whole queue, oldest first.
    pub fn detach(&mut self) -> VecDeque<QueuedRequest> {
        std::mem::take(&mut self.pending)
    }
}

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    /// Replays every deferred request once the last active write completes.
    pub(crate) fn maybe_replay_queue(&mut self) {
        if !self.writes.is_empty() || self.queue.is_empty() {
            return;
        }
        let pending = self.queue.detach();
        info!("📨 Replaying {} deferred selection request(s)", pending.len());
        for req in pending {
            let _ = self.admit_request(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(requestor: Window, property: Atom) -> QueuedRequest {
        QueuedRequest {
            requestor,
            selection: 1,
            target: 2,
            property,
            time: 0,
            producer: None,
        }
    }

    #[test]
    fn test_detach_preserves_arrival_order() {
        let mut queue = RequestQueue::default();
        queue.push(req(1, 10));
        queue.push(req(2, 20));
        queue.push(req(1, 10));

        let detached = queue.detach();
        let order: Vec<_> = detached.iter().map(|r| (r.requestor, r.property)).collect();
        assert_eq!(order, vec![(1, 10), (2, 20), (1, 10)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_conflicts_match_exact_pair_only() {
        let mut queue = RequestQueue::default();
        queue.push(req(1, 10));

        assert!(queue.conflicts(1, 10));
        assert!(!queue.conflicts(1, 11));
        assert!(!queue.conflicts(2, 10));
    }
}
