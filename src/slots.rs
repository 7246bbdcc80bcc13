//! Property-slot pool for outbound conversions
//!
//! Every outgoing "convert selection" request is tagged with a property
//! name on the shared transfer window so that overlapping conversions from
//! different owners never alias. Slots are minted on demand, recycled on
//! transfer completion, and their underlying atoms live for the whole
//! session.

use log::{debug, trace};

use crate::error::SelectionError;
use crate::proto::Atom;

/// One reserved property name on the transfer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub atom: Atom,
    index: u64,
}

impl Slot {
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Free pool plus the monotonic mint counter.
#[derive(Debug, Default)]
pub(crate) struct SlotPool {
    free: Vec<Slot>,
    next_index: u64,
}

impl SlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a recycled slot when one is free, otherwise mints a new one
    /// through `intern` (which maps an index to a permanently interned atom).
    pub fn acquire<F>(&mut self, intern: F) -> Result<Slot, SelectionError>
    where
        F: FnOnce(u64) -> Result<Atom, SelectionError>,
    {
        if let Some(slot) = self.free.pop() {
            trace!("♻️ Reusing transfer slot {}", slot.index);
            return Ok(slot);
        }
        let index = self.next_index;
        // Recycling keeps the namespace bounded by the peak number of
        // concurrent transfers; running the counter out is unrecoverable.
        self.next_index = self
            .next_index
            .checked_add(1)
            .expect("transfer slot namespace exhausted");
        let atom = intern(index)?;
        debug!("📎 Minted transfer slot {} (atom {})", index, atom);
        Ok(Slot { atom, index })
    }

    /// Returns a slot to the pool. The caller guarantees the underlying
    /// property has been deleted from the transfer window first.
    pub fn release(&mut self, slot: Slot) {
        debug_assert!(!self.free.contains(&slot), "slot released twice");
        self.free.push(slot);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn minted(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mint(index: u64) -> Result<Atom, SelectionError> {
        Ok(1000 + index as Atom)
    }

    #[test]
    fn test_mints_distinct_slots() {
        let mut pool = SlotPool::new();
        let a = pool.acquire(mint).unwrap();
        let b = pool.acquire(mint).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.minted(), 2);
    }

    #[test]
    fn test_release_recycles_before_minting() {
        let mut pool = SlotPool::new();
        let a = pool.acquire(mint).unwrap();
        pool.release(a);
        let b = pool.acquire(mint).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.minted(), 1);
    }

    #[test]
    fn test_mint_failure_is_propagated() {
        let mut pool = SlotPool::new();
        let err = pool.acquire(|_| Err(SelectionError::Transport("gone".into())));
        assert!(err.is_err());
        // The counter moved but no slot leaked into the free pool.
        assert_eq!(pool.free_count(), 0);
    }

    proptest! {
        /// No two concurrently-held slots are ever equal, for any
        /// interleaving of acquires and releases.
        #[test]
        fn prop_held_slots_never_alias(ops in proptest::collection::vec(any::<bool>(), 1..256)) {
            let mut pool = SlotPool::new();
            let mut held: Vec<Slot> = Vec::new();
            for acquire in ops {
                if acquire {
                    let slot = pool.acquire(mint).unwrap();
                    prop_assert!(!held.contains(&slot));
                    held.push(slot);
                } else if let Some(slot) = held.pop() {
                    pool.release(slot);
                }
            }
        }
    }
}
