//! Locked-buffer accounting.
//!
//! One [`SlotEntry`] per buffer the CPU may hold at once. A free entry carries
//! the unused ticket; an occupied entry carries the ticket issued when it was
//! locked, which is what [`LockToken`] matches on unlock.
//!
//! Invariant: `locked == entries.iter().filter(|e| e.is_occupied()).count()`,
//! and `locked <= entries.len()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::GraphicBuffer;

/// Ticket value marking a free entry. Never issued.
const UNUSED_TICKET: u64 = 0;

/// Tickets are unique across every consumer in the process, so a token from
/// one consumer can never match an entry of another.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

fn issue_ticket() -> u64 {
    NEXT_TICKET.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identity of one successful lock, returned inside the locked view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken {
    entry: usize,
    ticket: u64,
}

impl LockToken {
    /// A token that matches nothing.
    pub const UNUSED: LockToken = LockToken {
        entry: 0,
        ticket: UNUSED_TICKET,
    };

    /// Index of the accounting entry holding the lock.
    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn is_unused(&self) -> bool {
        self.ticket == UNUSED_TICKET
    }
}

/// How the CPU-visible memory of a locked entry was produced.
#[derive(Debug, Default)]
pub(crate) enum LockedMemory {
    /// Not locked
    #[default]
    None,
    /// The hardware buffer itself is mapped and must be unlocked
    Mapped,
    /// Contents were converted into this scratch buffer; the hardware buffer
    /// was never CPU-mapped
    Converted(Vec<u8>),
}

#[derive(Debug, Default)]
pub(crate) struct SlotEntry {
    pub(crate) slot: usize,
    pub(crate) buffer: Option<Arc<dyn GraphicBuffer>>,
    pub(crate) memory: LockedMemory,
    ticket: u64,
}

impl SlotEntry {
    pub(crate) fn is_occupied(&self) -> bool {
        self.ticket != UNUSED_TICKET
    }

    /// Scratch buffer backing a converted lock.
    pub(crate) fn scratch(&self) -> Option<&[u8]> {
        match &self.memory {
            LockedMemory::Converted(scratch) => Some(scratch),
            _ => None,
        }
    }
}

/// Contents of an entry that was just vacated.
#[derive(Debug)]
pub(crate) struct VacatedEntry {
    pub(crate) slot: usize,
    pub(crate) buffer: Arc<dyn GraphicBuffer>,
    pub(crate) memory: LockedMemory,
}

#[derive(Debug)]
pub(crate) struct SlotTable {
    entries: Vec<SlotEntry>,
    locked: usize,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| SlotEntry::default()).collect(),
            locked: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn locked_count(&self) -> usize {
        self.locked
    }

    pub(crate) fn is_full(&self) -> bool {
        self.locked == self.entries.len()
    }

    /// First free entry, if any.
    pub(crate) fn first_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_occupied())
    }

    /// Returns true if some occupied entry already holds `buffer`.
    pub(crate) fn holds(&self, buffer: &Arc<dyn GraphicBuffer>) -> bool {
        self.entries
            .iter()
            .filter_map(|e| e.buffer.as_ref())
            .any(|b| Arc::ptr_eq(b, buffer))
    }

    /// Marks a free entry occupied and issues its token.
    pub(crate) fn occupy(
        &mut self,
        index: usize,
        slot: usize,
        buffer: Arc<dyn GraphicBuffer>,
        memory: LockedMemory,
    ) -> LockToken {
        debug_assert!(!self.holds(&buffer), "buffer locked twice");
        let entry = &mut self.entries[index];
        assert!(!entry.is_occupied(), "entry {index} is already occupied");

        let ticket = issue_ticket();
        entry.slot = slot;
        entry.buffer = Some(buffer);
        entry.memory = memory;
        entry.ticket = ticket;
        self.locked += 1;

        LockToken {
            entry: index,
            ticket,
        }
    }

    /// Finds the occupied entry matching `token`. The unused token never matches.
    pub(crate) fn find(&self, token: LockToken) -> Option<usize> {
        if token.is_unused() {
            return None;
        }
        self.entries
            .get(token.entry)
            .filter(|e| e.ticket == token.ticket)
            .map(|_| token.entry)
    }

    pub(crate) fn entry(&self, index: usize) -> &SlotEntry {
        &self.entries[index]
    }

    /// Resets an occupied entry to the free state and returns what it held.
    pub(crate) fn vacate(&mut self, index: usize) -> Option<VacatedEntry> {
        let entry = &mut self.entries[index];
        if !entry.is_occupied() {
            return None;
        }
        let taken = std::mem::take(entry);
        self.locked -= 1;

        Some(VacatedEntry {
            slot: taken.slot,
            buffer: taken.buffer?,
            memory: taken.memory,
        })
    }

    /// Vacates every occupied entry.
    pub(crate) fn drain(&mut self) -> Vec<VacatedEntry> {
        (0..self.entries.len())
            .filter_map(|index| self.vacate(index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraphicBuffer;
    use crate::PixelFormat;

    fn buffer() -> Arc<dyn GraphicBuffer> {
        Arc::new(MemoryGraphicBuffer::new(8, 8, PixelFormat::Rgba8888))
    }

    #[test]
    fn test_occupy_and_vacate_keep_count() {
        let mut table = SlotTable::new(2);
        assert_eq!(table.first_free(), Some(0));

        let a = table.occupy(0, 5, buffer(), LockedMemory::Mapped);
        assert_eq!(table.locked_count(), 1);
        assert_eq!(table.first_free(), Some(1));

        let b = table.occupy(1, 6, buffer(), LockedMemory::Mapped);
        assert!(table.is_full());
        assert_eq!(table.first_free(), None);
        assert_ne!(a, b);

        let Some(index) = table.find(a) else {
            panic!("token a should match");
        };
        let Some(vacated) = table.vacate(index) else {
            panic!("entry should be occupied");
        };
        assert_eq!(vacated.slot, 5);
        assert_eq!(table.locked_count(), 1);
        assert_eq!(table.find(a), None);
        assert!(table.find(b).is_some());
    }

    #[test]
    fn test_unused_token_never_matches() {
        let mut table = SlotTable::new(1);
        assert_eq!(table.find(LockToken::UNUSED), None);

        table.occupy(0, 0, buffer(), LockedMemory::Mapped);
        assert_eq!(table.find(LockToken::UNUSED), None);
    }

    #[test]
    fn test_stale_token_rejected_after_reuse() {
        let mut table = SlotTable::new(1);
        let first = table.occupy(0, 0, buffer(), LockedMemory::Mapped);
        table.vacate(0);
        let second = table.occupy(0, 0, buffer(), LockedMemory::Mapped);

        assert_eq!(first.entry(), second.entry());
        assert_eq!(table.find(first), None);
        assert_eq!(table.find(second), Some(0));
    }

    #[test]
    fn test_vacate_free_entry_is_noop() {
        let mut table = SlotTable::new(2);
        assert!(table.vacate(1).is_none());
        assert_eq!(table.locked_count(), 0);
    }

    #[test]
    fn test_drain_frees_everything() {
        let mut table = SlotTable::new(3);
        table.occupy(0, 1, buffer(), LockedMemory::Mapped);
        table.occupy(2, 3, buffer(), LockedMemory::Converted(vec![0; 6]));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(table.locked_count(), 0);
        assert!(table.entry(2).scratch().is_none());
    }
}
