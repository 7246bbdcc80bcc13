//! Batch (MULTIPLE) conversion coordinator
//!
//! A batch request names an array of (target, property) pairs in a single
//! round trip. Each viable pair becomes an independent write transfer; the
//! two reflexive targets are answered inline without spawning one. Failed
//! pairs have their property atom zeroed in place, and one aggregate reply
//! goes out exactly once, when the pending counter reaches zero — per-pair
//! failure is never fatal to the batch.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::engine::SelectionEngine;
use crate::proto::{Atom, TimerHost, Timestamp, Transport, Window};

/// One outstanding batch request and its mutable pair array.
pub(crate) struct MultiRecord {
    pub requestor: Window,
    pub selection: Atom,
    pub property: Atom,
    pub time: Timestamp,
    /// (target, property) pairs; a zeroed property marks a failed pair.
    pub pairs: Vec<(Atom, Atom)>,
    pub pending: usize,
}

impl<T: Transport, H: TimerHost> SelectionEngine<T, H> {
    /// Expands a MULTIPLE request. The caller has already verified that the
    /// selection is owned, the request time is fresh, and `property` is
    /// nonzero.
    pub(crate) fn handle_multiple(
        &mut self,
        requestor: Window,
        selection: Atom,
        property: Atom,
        time: Timestamp,
    ) {
        let words = match self.transport.read_property_words(requestor, property) {
            Ok(words) => words,
            Err(err) => {
                warn!("📦 Unreadable batch pair array: {}", err);
                self.refuse_request(requestor, selection, self.atoms.multiple, time, "bad batch");
                return;
            }
        };
        if words.is_empty() || words.len() % 2 != 0 {
            self.refuse_request(
                requestor,
                selection,
                self.atoms.multiple,
                time,
                "malformed pair array",
            );
            return;
        }

        let mut pairs: Vec<(Atom, Atom)> = words.chunks(2).map(|pair| (pair[0], pair[1])).collect();
        debug!(
            "📦 Batch request from {:#x}: {} pair(s) via property {}",
            requestor,
            pairs.len(),
            property
        );

        let record = self.next_id();
        let mut pending = 0usize;
        let mut claimed: HashSet<Atom> = HashSet::new();
        for index in 0..pairs.len() {
            let (target, pair_property) = pairs[index];
            if pair_property == 0 {
                // Already the failure marker; nothing to convert into.
                continue;
            }
            if target == self.atoms.targets {
                if !self.reply_targets(requestor, selection, pair_property) {
                    pairs[index].1 = 0;
                }
                continue;
            }
            if target == self.atoms.timestamp {
                if !self.reply_timestamp(requestor, selection, pair_property) {
                    pairs[index].1 = 0;
                }
                continue;
            }
            if target == self.atoms.multiple {
                // Nested batches are rejected per element, never recursed.
                pairs[index].1 = 0;
                continue;
            }
            if !claimed.insert(pair_property) || self.write_conflicts(requestor, pair_property) {
                // Duplicate destination inside the batch, or the pair is
                // already busy; queueing a batch child would deadlock the
                // aggregate reply.
                pairs[index].1 = 0;
                continue;
            }

            let producer = {
                let Some(owner) = self.owners.get_mut(&selection) else {
                    pairs[index].1 = 0;
                    continue;
                };
                if !owner.targets.contains(&target) {
                    pairs[index].1 = 0;
                    continue;
                }
                match owner.source.start(target) {
                    Ok(producer) => producer,
                    Err(err) => {
                        warn!("📦 Source failed to start target {}: {}", target, err);
                        pairs[index].1 = 0;
                        continue;
                    }
                }
            };
            match self.start_write(
                requestor,
                selection,
                target,
                pair_property,
                time,
                producer,
                Some((record, index)),
            ) {
                Ok(_) => pending += 1,
                Err(err) => {
                    warn!("📦 Could not spawn batch child: {}", err);
                    pairs[index].1 = 0;
                }
            }
        }

        let rec = MultiRecord {
            requestor,
            selection,
            property,
            time,
            pairs,
            pending,
        };
        if rec.pending == 0 {
            self.reply_multiple(rec);
        } else {
            self.multis.insert(record, rec);
        }
    }

    /// Settles one spawned pair; fires the aggregate reply on the last one.
    pub(crate) fn multi_child_done(&mut self, record: u64, index: usize, success: bool) {
        let Some(mut rec) = self.multis.remove(&record) else {
            return;
        };
        if !success {
            if let Some(pair) = rec.pairs.get_mut(index) {
                pair.1 = 0;
            }
        }
        rec.pending = rec.pending.saturating_sub(1);
        if rec.pending == 0 {
            self.reply_multiple(rec);
        } else {
            self.multis.insert(record, rec);
        }
    }

    /// Rewrites the pair array with failed conversions zeroed, then sends
    /// the single aggregate notify.
    fn reply_multiple(&mut self, rec: MultiRecord) {
        let failed = rec.pairs.iter().filter(|pair| pair.1 == 0).count();
        let words: Vec<u32> = rec
            .pairs
            .iter()
            .flat_map(|&(target, property)| [target, property])
            .collect();
        let sent = self
            .transport
            .write_property_words(rec.requestor, rec.property, self.atoms.atom_pair, &words)
            .and_then(|_| {
                self.transport.send_notify(
                    rec.requestor,
                    rec.selection,
                    self.atoms.multiple,
                    Some(rec.property),
                    rec.time,
                )
            })
            .and_then(|_| self.transport.flush());
        if let Err(err) = sent {
            warn!("📦 Failed to deliver batch reply: {}", err);
            return;
        }
        info!(
            "📦 Batch answered for {:#x}: {} pair(s), {} failed",
            rec.requestor,
            rec.pairs.len(),
            failed
        );
    }
}
