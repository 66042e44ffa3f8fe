//! Pending Tables
//!
//! Circular tables of entries due at a future tick, indexed by `tick % window`.
//! Every slot carries the tick it was written for, so a read for a tick that
//! was never populated (or whose slot was reused) yields nothing, and a read
//! consumes the entry.

use common::Tti;
use tracing::{error, warn};

#[derive(Debug, Clone)]
struct Slot<T> {
    tti: Tti,
    value: T,
}

/// Circular table of tick-tagged entries
#[derive(Debug, Clone)]
pub struct PendingTable<T> {
    slots: Vec<Option<Slot<T>>>,
    modulus: u32,
    nof_overwritten: u64,
}

impl<T> PendingTable<T> {
    /// Create a table of `window` slots for ticks reduced modulo `modulus`
    pub fn new(window: u32, modulus: u32) -> Self {
        assert!(window > 0, "pending table needs at least one slot");
        Self {
            slots: (0..window).map(|_| None).collect(),
            modulus,
            nof_overwritten: 0,
        }
    }

    /// Number of slots
    pub fn window(&self) -> u32 {
        self.slots.len() as u32
    }

    fn index(&self, tti: Tti) -> usize {
        (tti.0 % self.window()) as usize
    }

    /// Abort when `tti` lies too far ahead of `now` for the window
    fn check_delay(&self, now: Tti, tti: Tti) {
        let delay = tti.distance_from(now, self.modulus);
        if delay >= self.window() {
            error!(
                "Pending entry for tick {} written at tick {} exceeds window of {}",
                tti,
                now,
                self.window()
            );
            panic!(
                "pending table overrun: delay {} >= window {}",
                delay,
                self.window()
            );
        }
    }

    fn evict_stale(&mut self, idx: usize, tti: Tti) {
        if let Some(slot) = &self.slots[idx] {
            if slot.tti != tti {
                warn!("Pending entry for tick {} overwritten by tick {} before use", slot.tti, tti);
                self.nof_overwritten += 1;
                self.slots[idx] = None;
            }
        }
    }

    /// Store `value` for `tti`, replacing whatever was there for the same tick.
    ///
    /// `now` is the tick of the writer; the write panics if `tti` is a full
    /// window or more ahead of it.
    pub fn set(&mut self, now: Tti, tti: Tti, value: T) {
        self.check_delay(now, tti);
        let idx = self.index(tti);
        self.evict_stale(idx, tti);
        self.slots[idx] = Some(Slot { tti, value });
    }

    /// Modify the entry for `tti`, creating it with `init` when absent
    pub fn update<I, F>(&mut self, now: Tti, tti: Tti, init: I, f: F)
    where
        I: FnOnce() -> T,
        F: FnOnce(&mut T),
    {
        self.check_delay(now, tti);
        let idx = self.index(tti);
        self.evict_stale(idx, tti);
        let slot = self.slots[idx].get_or_insert_with(|| Slot { tti, value: init() });
        f(&mut slot.value);
    }

    /// Take the entry for `tti`, leaving the slot empty
    pub fn take(&mut self, tti: Tti) -> Option<T> {
        let idx = self.index(tti);
        match &self.slots[idx] {
            Some(slot) if slot.tti == tti => self.slots[idx].take().map(|slot| slot.value),
            _ => None,
        }
    }

    /// Whether an entry for `tti` is waiting
    pub fn contains(&self, tti: Tti) -> bool {
        matches!(&self.slots[self.index(tti)], Some(slot) if slot.tti == tti)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Entries replaced before they were consumed
    pub fn nof_overwritten(&self) -> u64 {
        self.nof_overwritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULUS: u32 = 10240;

    #[test]
    fn test_take_is_exactly_once() {
        let mut table = PendingTable::new(20, MODULUS);
        table.set(Tti(100), Tti(108), "grant");
        assert!(table.contains(Tti(108)));
        assert_eq!(table.take(Tti(108)), Some("grant"));
        assert_eq!(table.take(Tti(108)), None);
    }

    #[test]
    fn test_unpopulated_and_aliased_slots_are_absent() {
        let mut table = PendingTable::new(20, MODULUS);
        assert_eq!(table.take(Tti(5)), None);
        table.set(Tti(0), Tti(5), 1u32);
        // same slot, different tick
        assert_eq!(table.take(Tti(25)), None);
        assert_eq!(table.take(Tti(5)), Some(1));
    }

    #[test]
    fn test_update_accumulates() {
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(20, MODULUS);
        table.update(Tti(0), Tti(8), Vec::new, |v| v.push(1));
        table.update(Tti(0), Tti(8), Vec::new, |v| v.push(2));
        assert_eq!(table.take(Tti(8)), Some(vec![1, 2]));
    }

    #[test]
    fn test_stale_entry_is_counted() {
        let mut table = PendingTable::new(20, MODULUS);
        table.set(Tti(0), Tti(8), 1u8);
        table.set(Tti(20), Tti(28), 2u8);
        assert_eq!(table.nof_overwritten(), 1);
        assert_eq!(table.take(Tti(8)), None);
        assert_eq!(table.take(Tti(28)), Some(2));
    }

    #[test]
    fn test_wrap_around() {
        let mut table = PendingTable::new(20, MODULUS);
        table.set(Tti(10236), Tti(4), 7u8);
        assert_eq!(table.take(Tti(4)), Some(7));
    }

    #[test]
    #[should_panic(expected = "pending table overrun")]
    fn test_overrun_is_fatal() {
        let mut table = PendingTable::new(8, MODULUS);
        table.set(Tti(0), Tti(8), 0u8);
    }

    #[test]
    fn test_clear() {
        let mut table = PendingTable::new(4, MODULUS);
        table.set(Tti(0), Tti(1), 0u8);
        table.clear();
        assert!(!table.contains(Tti(1)));
    }
}
